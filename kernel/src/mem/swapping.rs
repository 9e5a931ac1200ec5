//! Moving pages between physical frames and the backing store.

use super::address_space::{AddressSpace, SpaceId};
use super::error::VmError;
use super::frame_allocator::{FrameId, Page};
use super::page_replacement::select_victim;
use super::page_table::{set_paged_out, set_resident, walk_lookup, PteLoc, PteState};
use super::Vm;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use log::debug;
use swapcore_shared::mem::page_round_down;

/// Where evicted pages live. Keyed by address space and virtual page
/// address; a write replaces any page stored under the same key.
///
/// Store errors are fatal to the faulting process, so implementations
/// should only fail on genuine device trouble.
pub trait BackingStore {
    fn write_page(&mut self, space: SpaceId, vpage: usize, page: &Page) -> Result<(), VmError>;
    fn read_page(&mut self, space: SpaceId, vpage: usize, page: &mut Page) -> Result<(), VmError>;
}

/// Heap-backed store. The real system would sit on a disk partition;
/// the paging machinery only ever sees the trait.
pub struct MemBackingStore {
    pages: BTreeMap<(SpaceId, usize), Box<Page>>,
}

impl MemBackingStore {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    pub fn stored_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn contains(&self, space: SpaceId, vpage: usize) -> bool {
        self.pages.contains_key(&(space, vpage))
    }
}

impl Default for MemBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for MemBackingStore {
    fn write_page(&mut self, space: SpaceId, vpage: usize, page: &Page) -> Result<(), VmError> {
        self.pages
            .insert((space, vpage), Box::new(page.clone()));
        Ok(())
    }

    fn read_page(&mut self, space: SpaceId, vpage: usize, page: &mut Page) -> Result<(), VmError> {
        let stored = self
            .pages
            .get(&(space, vpage))
            .ok_or(VmError::BackingStore)?;
        page.0.copy_from_slice(&stored.0);
        Ok(())
    }
}

/// Hook for keeping the hardware translation state coherent after the
/// tables change underneath it.
pub trait TranslationControl {
    fn reload_root(&mut self, root: FrameId);
}

/// For hosts with no translation hardware in the loop.
pub struct NullTranslation;

impl TranslationControl for NullTranslation {
    fn reload_root(&mut self, _root: FrameId) {}
}

impl<S: BackingStore, T: TranslationControl> Vm<S, T> {
    /// Pushes one resident page out to the backing store to make room,
    /// chosen by the configured policy.
    pub(crate) fn evict_one(&mut self, space: &mut AddressSpace) -> Result<(), VmError> {
        let index = select_victim(self.policy, &mut self.pool, space);
        let slot = *space.resident.get(index).expect("victim slot is in use");
        let loc = walk_lookup(&self.pool, space.root, slot.vpage)
            .expect("resident page has no page table");
        let PteState::Resident { frame, .. } = loc.state(&self.pool) else {
            panic!("tracked page {:#x} is not resident", slot.vpage);
        };

        self.store
            .write_page(space.id, slot.vpage, self.pool.frame(frame))?;
        set_paged_out(&mut self.pool, loc);
        self.pool.free(frame);
        space.resident.clear_index(index);
        space.on_store.insert(slot.vpage);
        space.paged_out_count += 1;
        self.tlb.reload_root(space.root);
        debug!("{}: evicted vpage {:#x}", space.id, slot.vpage);
        Ok(())
    }

    /// Services a fault at `addr`. Only a fault on a paged-out entry is
    /// legitimate; anything else is reported as an illegal access for
    /// the caller to kill the process over.
    pub fn handle_page_fault(
        &mut self,
        space: &mut AddressSpace,
        addr: usize,
    ) -> Result<(), VmError> {
        let vpage = page_round_down(addr);
        let Some(loc) = walk_lookup(&self.pool, space.root, vpage) else {
            return Err(VmError::IllegalAccess);
        };
        match loc.state(&self.pool) {
            PteState::OnBackingStore { .. } => self.fault_in(space, vpage, loc),
            PteState::Resident { .. } | PteState::Absent => Err(VmError::IllegalAccess),
        }
    }

    /// Brings a paged-out page back into a frame. When the resident
    /// table is full this swaps: the faulting page comes in through a
    /// scratch buffer while the victim goes out to the store.
    fn fault_in(
        &mut self,
        space: &mut AddressSpace,
        vpage: usize,
        loc: PteLoc,
    ) -> Result<(), VmError> {
        space.fault_count += 1;
        space.paged_out_count += 1;
        let frame = self.pool.alloc()?;
        self.pool.frame_mut(frame).zero();

        if space.resident.has_room() {
            set_resident(&mut self.pool, loc, frame);
            self.store
                .read_page(space.id, vpage, self.pool.frame_mut(frame))?;
            let stamp = space.next_stamp();
            space.resident.insert(vpage, stamp);
            space.on_store.remove(vpage);
            self.tlb.reload_root(space.root);
            debug!("{}: faulted in vpage {:#x}", space.id, vpage);
            return Ok(());
        }

        // No free slot: swap with a victim. The faulting page lands in
        // its frame through a scratch buffer so the store never holds
        // both directions of the exchange at once.
        let index = select_victim(self.policy, &mut self.pool, space);
        let victim = *space.resident.get(index).expect("victim slot is in use");
        let victim_loc = walk_lookup(&self.pool, space.root, victim.vpage)
            .expect("resident page has no page table");
        let PteState::Resident {
            frame: victim_frame,
            ..
        } = victim_loc.state(&self.pool)
        else {
            panic!("tracked page {:#x} is not resident", victim.vpage);
        };

        set_resident(&mut self.pool, loc, frame);
        let mut buffer = Page::ZERO;
        self.store.read_page(space.id, vpage, &mut buffer)?;
        let stamp = space.next_stamp();
        space.resident.replace(index, vpage, stamp);
        space.on_store.remove(vpage);
        self.pool.frame_mut(frame).0.copy_from_slice(&buffer.0);

        self.store
            .write_page(space.id, victim.vpage, self.pool.frame(victim_frame))?;
        set_paged_out(&mut self.pool, victim_loc);
        self.pool.free(victim_frame);
        space.on_store.insert(victim.vpage);
        self.tlb.reload_root(space.root);
        debug!(
            "{}: faulted in vpage {:#x}, swapped out vpage {:#x}",
            space.id, vpage, victim.vpage
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page_replacement::ReplacementPolicy;
    use crate::mem::{MAX_TOTAL_PAGES, RESIDENT_CAPACITY};
    use alloc::collections::BTreeSet;
    use swapcore_shared::mem::PAGE_FRAME_SIZE;

    /// Counts root reloads so tests can check translation state is
    /// refreshed whenever the tables change.
    struct CountingTranslation {
        reloads: usize,
    }

    impl TranslationControl for CountingTranslation {
        fn reload_root(&mut self, _root: FrameId) {
            self.reloads += 1;
        }
    }

    fn test_vm(policy: ReplacementPolicy) -> Vm<MemBackingStore, CountingTranslation> {
        Vm::new(
            128,
            MemBackingStore::new(),
            CountingTranslation { reloads: 0 },
            policy,
        )
        .expect("policy is implemented")
    }

    /// A page is resident or on the backing store, never both, and the
    /// occupancy never exceeds the fixed budgets.
    fn assert_tables_consistent(space: &AddressSpace) {
        let resident: BTreeSet<usize> = space.resident_pages().map(|p| p.vpage).collect();
        let stored: BTreeSet<usize> = space.paged_out_pages().collect();
        assert!(
            resident.is_disjoint(&stored),
            "a page is both resident and on the backing store"
        );
        assert!(resident.len() <= RESIDENT_CAPACITY);
        assert!(resident.len() + stored.len() <= MAX_TOTAL_PAGES);
    }

    #[test]
    fn test_mem_store_round_trip() {
        let mut store = MemBackingStore::new();
        let id = SpaceId(3);
        let mut page = Page::ZERO;
        page.0[17] = 0x5A;
        store.write_page(id, 0x4000, &page).expect("store accepts");

        let mut got = Page::ZERO;
        store.read_page(id, 0x4000, &mut got).expect("page stored");
        assert_eq!(got.0[17], 0x5A);
        assert!(matches!(
            store.read_page(id, 0x8000, &mut got),
            Err(VmError::BackingStore)
        ));
        assert!(matches!(
            store.read_page(SpaceId(4), 0x4000, &mut got),
            Err(VmError::BackingStore)
        ));
    }

    #[test]
    fn test_growth_past_capacity_evicts() {
        let mut vm = test_vm(ReplacementPolicy::Lifo);
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, (RESIDENT_CAPACITY + 1) * PAGE_FRAME_SIZE)
            .expect("within budget");

        let stats = space.stats();
        assert_eq!(stats.resident_used, RESIDENT_CAPACITY);
        assert_eq!(stats.on_store_used, 1);
        assert_eq!(stats.paged_out_count, 1);
        assert_eq!(vm.backing_store().stored_pages(), 1);
        // Most recently loaded at the time of the eviction.
        assert!(vm
            .backing_store()
            .contains(space.id(), (RESIDENT_CAPACITY - 1) * PAGE_FRAME_SIZE));
        assert_tables_consistent(&space);
        vm.teardown(space);
    }

    #[test]
    fn test_fault_in_restores_page_contents() {
        let mut vm = test_vm(ReplacementPolicy::Lifo);
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, RESIDENT_CAPACITY * PAGE_FRAME_SIZE)
            .expect("within budget");

        // Fill the newest page, then push it out by growing one more.
        let marked = (RESIDENT_CAPACITY - 1) * PAGE_FRAME_SIZE;
        vm.copy_to_user(&mut space, marked + 8, &[0xDE, 0xAD, 0xBE, 0xEF])
            .expect("page is resident");
        vm.grow(&mut space, (RESIDENT_CAPACITY + 1) * PAGE_FRAME_SIZE)
            .expect("within budget");
        assert!(space.paged_out_pages().any(|v| v == marked));

        // Reading it faults it back with its contents intact.
        let mut got = [0u8; 4];
        vm.copy_from_user(&mut space, marked + 8, &mut got)
            .expect("fault is serviced");
        assert_eq!(got, [0xDE, 0xAD, 0xBE, 0xEF]);

        let stats = space.stats();
        assert_eq!(stats.fault_count, 1);
        assert!(space.resident_pages().any(|p| p.vpage == marked));
        assert!(!space.paged_out_pages().any(|v| v == marked));
        assert_tables_consistent(&space);
        vm.teardown(space);
    }

    #[test]
    fn test_swap_preserves_both_directions() {
        let mut vm = test_vm(ReplacementPolicy::Lifo);
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, (RESIDENT_CAPACITY + 1) * PAGE_FRAME_SIZE)
            .expect("within budget");

        // The resident table is full, so every fault from here on swaps
        // through the scratch buffer.
        let out = (RESIDENT_CAPACITY - 1) * PAGE_FRAME_SIZE;
        assert!(space.paged_out_pages().any(|v| v == out));
        vm.copy_to_user(&mut space, 0x0, &[0x11; 8])
            .expect("page is resident");
        vm.copy_to_user(&mut space, out, &[0x22; 8])
            .expect("fault is serviced");
        assert_tables_consistent(&space);

        // The page displaced by that swap comes back intact too.
        let displaced = space.paged_out_pages().next().expect("one page on store");
        let mut got = [0u8; 8];
        vm.copy_from_user(&mut space, out, &mut got)
            .expect("page is resident");
        assert_eq!(got, [0x22; 8]);
        vm.copy_from_user(&mut space, displaced, &mut got)
            .expect("fault is serviced");
        assert_tables_consistent(&space);

        let stats = space.stats();
        assert_eq!(stats.resident_used, RESIDENT_CAPACITY);
        assert_eq!(stats.on_store_used, 1);
        vm.teardown(space);
    }

    #[test]
    fn test_second_chance_spares_touched_page() {
        let mut vm = test_vm(ReplacementPolicy::SecondChanceFifo);
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, RESIDENT_CAPACITY * PAGE_FRAME_SIZE)
            .expect("within budget");

        // Touch the oldest page so the scan passes it over.
        let mut got = [0u8; 1];
        vm.copy_from_user(&mut space, 0x0, &mut got)
            .expect("page is resident");
        vm.grow(&mut space, (RESIDENT_CAPACITY + 1) * PAGE_FRAME_SIZE)
            .expect("within budget");

        assert!(space.resident_pages().any(|p| p.vpage == 0));
        assert!(space.paged_out_pages().any(|v| v == PAGE_FRAME_SIZE));
        assert_tables_consistent(&space);
        vm.teardown(space);
    }

    #[test]
    fn test_fault_on_unmapped_address_is_illegal() {
        let mut vm = test_vm(ReplacementPolicy::Lifo);
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, PAGE_FRAME_SIZE).expect("within budget");

        // No page table at all.
        assert!(matches!(
            vm.handle_page_fault(&mut space, 0x4000_0000),
            Err(VmError::IllegalAccess)
        ));
        // Table exists but the entry is absent.
        assert!(matches!(
            vm.handle_page_fault(&mut space, 5 * PAGE_FRAME_SIZE),
            Err(VmError::IllegalAccess)
        ));
        // A fault on a resident page means the hardware state is stale,
        // not that there is anything to page in.
        assert!(matches!(
            vm.handle_page_fault(&mut space, 0x10),
            Err(VmError::IllegalAccess)
        ));
        assert_eq!(space.stats().fault_count, 0);
        vm.teardown(space);
    }

    #[test]
    fn test_translation_reloaded_after_table_changes() {
        let mut vm = test_vm(ReplacementPolicy::Lifo);
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, RESIDENT_CAPACITY * PAGE_FRAME_SIZE)
            .expect("within budget");
        let baseline = vm.tlb.reloads;

        // Eviction unmaps a page, so the root must be reloaded.
        vm.grow(&mut space, (RESIDENT_CAPACITY + 1) * PAGE_FRAME_SIZE)
            .expect("within budget");
        assert!(vm.tlb.reloads > baseline);

        // So must a fault-in.
        let baseline = vm.tlb.reloads;
        let out = space.paged_out_pages().next().expect("one page on store");
        vm.handle_page_fault(&mut space, out)
            .expect("fault is serviced");
        assert!(vm.tlb.reloads > baseline);
        vm.teardown(space);
    }

    #[test]
    fn test_duplicate_carries_paged_out_pages() {
        let mut vm = test_vm(ReplacementPolicy::Lifo);
        let mut parent = vm.create_space(false).expect("pool has room");
        vm.grow(&mut parent, RESIDENT_CAPACITY * PAGE_FRAME_SIZE)
            .expect("within budget");
        let marked = (RESIDENT_CAPACITY - 1) * PAGE_FRAME_SIZE;
        vm.copy_to_user(&mut parent, marked, &[0x77; 16])
            .expect("page is resident");
        vm.grow(&mut parent, (RESIDENT_CAPACITY + 1) * PAGE_FRAME_SIZE)
            .expect("within budget");
        assert!(parent.paged_out_pages().any(|v| v == marked));

        let mut child = vm.duplicate(&parent).expect("pool has room");
        // The copy is paged out in the child too, under its own key.
        assert!(child.paged_out_pages().any(|v| v == marked));
        assert!(vm.backing_store().contains(child.id(), marked));
        assert_tables_consistent(&child);

        let mut got = [0u8; 16];
        vm.copy_from_user(&mut child, marked, &mut got)
            .expect("fault is serviced");
        assert_eq!(got, [0x77; 16]);
        assert_eq!(child.stats().fault_count, 1);

        vm.teardown(parent);
        vm.teardown(child);
    }
}
