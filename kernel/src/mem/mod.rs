pub mod address_space;
pub mod error;
pub mod frame_allocator;
pub mod page_replacement;
pub mod page_table;
pub mod swapping;
pub mod user;

pub use address_space::{AddressSpace, ResidentPage, SpaceId, SpaceStats};
pub use error::VmError;
pub use frame_allocator::{FrameId, FramePool, Page};
pub use page_replacement::ReplacementPolicy;
pub use page_table::PteState;
pub use swapping::{BackingStore, MemBackingStore, NullTranslation, TranslationControl};

use log::debug;
use page_table::{free_table, map_range, setup_kernel_map, walk_lookup};
use swapcore_shared::mem::{
    page_round_up, HUGE_PAGE_SIZE, OFFSET, PAGE_FRAME_SIZE,
};

/// How many of a process's pages may be resident at once.
pub const RESIDENT_CAPACITY: usize = 15;
/// Hard per-process page budget, resident plus paged out.
pub const MAX_TOTAL_PAGES: usize = 30;
/// Capacity of the backing-store bookkeeping table.
pub const BACKING_CAPACITY: usize = MAX_TOTAL_PAGES - RESIDENT_CAPACITY;

/// The virtual-memory manager: owns the physical frame pool, the
/// backing store, the translation-root control and the replacement
/// policy, and carries out every mutation of an address space.
///
/// The frame pool and backing store are shared across all address
/// spaces; each [`AddressSpace`] is mutated only on behalf of its own
/// process (callers serialize with a per-space lock).
pub struct Vm<S: BackingStore, T: TranslationControl> {
    pool: FramePool,
    store: S,
    tlb: T,
    policy: ReplacementPolicy,
    next_space: u32,
}

impl<S: BackingStore, T: TranslationControl> Vm<S, T> {
    /// Builds a manager over `total_frames` physical frames. The
    /// replacement policy is fixed here for the manager's lifetime;
    /// the unimplemented placeholder is rejected now rather than at
    /// first eviction.
    pub fn new(
        total_frames: usize,
        store: S,
        tlb: T,
        policy: ReplacementPolicy,
    ) -> Result<Self, VmError> {
        Ok(Self {
            pool: FramePool::new(total_frames),
            store,
            tlb,
            policy: policy.validate()?,
            next_space: 1,
        })
    }

    /// Creates an empty address space seeded with the kernel mappings.
    /// Privileged bootstrap spaces are exempt from the page budget and
    /// from residency tracking; their pages are never evicted.
    pub fn create_space(&mut self, privileged: bool) -> Result<AddressSpace, VmError> {
        let root = setup_kernel_map(&mut self.pool)?;
        let id = self.fresh_space_id();
        Ok(AddressSpace::new(id, root, privileged))
    }

    fn fresh_space_id(&mut self) -> SpaceId {
        let id = SpaceId(self.next_space);
        self.next_space += 1;
        id
    }

    /// Grows the user range to `new_size`, allocating and mapping a
    /// zeroed frame per page, evicting a victim whenever the resident
    /// budget is full. All-or-nothing: on failure the space is shrunk
    /// back to its previous size and the error reported.
    pub fn grow(&mut self, space: &mut AddressSpace, new_size: usize) -> Result<usize, VmError> {
        if new_size >= OFFSET {
            return Err(VmError::AboveUserLimit);
        }
        let old_size = space.size;
        if new_size <= old_size {
            return Ok(old_size);
        }
        if !space.privileged && page_round_up(new_size) / PAGE_FRAME_SIZE > MAX_TOTAL_PAGES {
            return Err(VmError::PageBudgetExceeded);
        }

        let mut a = page_round_up(old_size);
        while a < new_size {
            let frame = match self.pool.alloc() {
                Ok(frame) => frame,
                Err(e) => {
                    self.shrink_impl(space, a, old_size);
                    return Err(e);
                }
            };
            self.pool.frame_mut(frame).zero();
            if let Err(e) = map_range(
                &mut self.pool,
                space.root,
                a,
                PAGE_FRAME_SIZE,
                frame.index() * PAGE_FRAME_SIZE,
                true,
                true,
            ) {
                self.pool.free(frame);
                self.shrink_impl(space, a, old_size);
                return Err(e);
            }
            if !space.privileged {
                if !space.resident.has_room() {
                    if let Err(e) = self.evict_one(space) {
                        self.shrink_impl(space, a + PAGE_FRAME_SIZE, old_size);
                        return Err(e);
                    }
                }
                let stamp = space.next_stamp();
                space.resident.insert(a, stamp);
            }
            a += PAGE_FRAME_SIZE;
        }
        space.size = new_size;
        debug!(
            "{}: grew {:#x} -> {:#x}",
            space.id, old_size, new_size
        );
        Ok(new_size)
    }

    /// Shrinks the user range to `new_size`, freeing resident frames
    /// and dropping swap bookkeeping for the vacated pages. Returns the
    /// resulting size.
    pub fn shrink(&mut self, space: &mut AddressSpace, new_size: usize) -> usize {
        let old_size = space.size;
        let result = self.shrink_impl(space, old_size, new_size);
        space.size = result;
        result
    }

    /// Releases user pages in `[round_up(new_size), old_size)` without
    /// touching the recorded size; growth rollback unwinds pages the
    /// caller never accounted for.
    fn shrink_impl(
        &mut self,
        space: &mut AddressSpace,
        old_size: usize,
        new_size: usize,
    ) -> usize {
        if new_size >= old_size {
            return old_size;
        }
        let mut a = page_round_up(new_size);
        let mut freed = false;
        while a < old_size {
            let Some(loc) = walk_lookup(&self.pool, space.root, a) else {
                // No page table for this slot: skip the whole range.
                a = (a / HUGE_PAGE_SIZE + 1) * HUGE_PAGE_SIZE;
                continue;
            };
            match loc.state(&self.pool) {
                PteState::Resident { frame, .. } => {
                    self.pool.free(frame);
                    space.resident.remove(a);
                    loc.clear(&mut self.pool);
                    freed = true;
                }
                PteState::OnBackingStore { .. } => {
                    space.on_store.remove(a);
                    loc.clear(&mut self.pool);
                }
                PteState::Absent => {}
            }
            a += PAGE_FRAME_SIZE;
        }
        if freed {
            self.tlb.reload_root(space.root);
        }
        new_size
    }

    /// Deep-copies an address space for fork. Resident pages are copied
    /// frame to frame; pages on the backing store are copied blob to
    /// blob under the child's key and stay paged out in the child.
    /// All-or-nothing: any failure frees the partial copy.
    pub fn duplicate(&mut self, parent: &AddressSpace) -> Result<AddressSpace, VmError> {
        let root = setup_kernel_map(&mut self.pool)?;
        let id = self.fresh_space_id();
        let mut child = AddressSpace::inherit(id, root, parent);

        let mut a = 0;
        while a < parent.size {
            let result = self.duplicate_page(parent, &mut child, a);
            if let Err(e) = result {
                self.shrink_impl(&mut child, a, 0);
                free_table(&mut self.pool, child.root);
                return Err(e);
            }
            a += PAGE_FRAME_SIZE;
        }
        debug!("{}: duplicated into {}", parent.id, child.id);
        Ok(child)
    }

    fn duplicate_page(
        &mut self,
        parent: &AddressSpace,
        child: &mut AddressSpace,
        va: usize,
    ) -> Result<(), VmError> {
        let loc = walk_lookup(&self.pool, parent.root, va)
            .unwrap_or_else(|| panic!("page {va:#x} below size has no page table"));
        match loc.state(&self.pool) {
            PteState::Absent => panic!("page {va:#x} below size is unmapped"),
            PteState::Resident {
                frame,
                writable,
                user,
                ..
            } => {
                let copy = self.pool.alloc()?;
                self.pool.copy(frame, copy);
                if let Err(e) = map_range(
                    &mut self.pool,
                    child.root,
                    va,
                    PAGE_FRAME_SIZE,
                    copy.index() * PAGE_FRAME_SIZE,
                    writable,
                    user,
                ) {
                    self.pool.free(copy);
                    return Err(e);
                }
                Ok(())
            }
            PteState::OnBackingStore { writable, user } => {
                let mut buffer = Page::ZERO;
                self.store.read_page(parent.id, va, &mut buffer)?;
                self.store.write_page(child.id, va, &buffer)?;
                page_table::install_paged_out(&mut self.pool, child.root, va, writable, user)
            }
        }
    }

    /// Destroys an address space: releases every user frame and all
    /// swap bookkeeping, then the page-table tree itself.
    pub fn teardown(&mut self, mut space: AddressSpace) {
        let old_size = space.size;
        self.shrink_impl(&mut space, old_size, 0);
        assert_eq!(
            space.resident.used(),
            0,
            "resident pages survived teardown"
        );
        free_table(&mut self.pool, space.root);
        debug!("{}: torn down", space.id);
    }

    /// Folds hardware accessed bits into the resident access counters.
    pub fn sample_access_bits(&mut self, space: &mut AddressSpace) {
        page_replacement::sample_access_bits(&mut self.pool, space);
    }

    pub fn policy(&self) -> ReplacementPolicy {
        self.policy
    }

    pub fn backing_store(&self) -> &S {
        &self.store
    }

    pub fn frames_allocated(&self) -> usize {
        self.pool.frames_allocated()
    }

    pub fn frames_free(&self) -> usize {
        self.pool.frames_free()
    }
}
