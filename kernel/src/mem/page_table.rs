// Virtual addresses handled here are 32-bit by construction (the user
// half is capped at OFFSET, the kernel ranges end at 4GB), so the
// usize -> u32 casts cannot truncate.
#![allow(clippy::cast_possible_truncation)]

use super::error::VmError;
use super::frame_allocator::{FrameId, FramePool, Page};
use arbitrary_int::u20;
use swapcore_shared::mem::{page_round_down, PAGE_FRAME_SIZE};
use swapcore_shared::paging::{
    kernel_mapping_ranges, PageDirectoryEntry, PageTableEntry, VirtualAddress, ENTRY_COUNT,
};
use zerocopy::FromBytes;

/// Raw-bits view of a frame holding a page directory or page table.
fn entries(page: &Page) -> &[u32; ENTRY_COUNT] {
    <[u32; ENTRY_COUNT]>::ref_from(&page.0).expect("a page frame is exactly one entry table")
}

fn entries_mut(page: &mut Page) -> &mut [u32; ENTRY_COUNT] {
    <[u32; ENTRY_COUNT]>::mut_from(&mut page.0).expect("a page frame is exactly one entry table")
}

/// The decoded state of a leaf entry. An entry is never simultaneously
/// resident and on the backing store; decoding such bits panics.
#[derive(Clone, Copy, Debug)]
pub enum PteState {
    Absent,
    Resident {
        frame: FrameId,
        writable: bool,
        user: bool,
        accessed: bool,
    },
    OnBackingStore {
        writable: bool,
        user: bool,
    },
}

/// Location of one leaf entry: the frame holding its page table plus
/// the index within it. The only handle through which entry bits are
/// read or written.
#[derive(Clone, Copy)]
pub(crate) struct PteLoc {
    table: FrameId,
    index: usize,
}

impl PteLoc {
    pub(crate) fn load(self, pool: &FramePool) -> PageTableEntry {
        PageTableEntry::new_with_raw_value(entries(pool.frame(self.table))[self.index])
    }

    pub(crate) fn store(self, pool: &mut FramePool, entry: PageTableEntry) {
        entries_mut(pool.frame_mut(self.table))[self.index] = entry.raw_value();
    }

    pub(crate) fn clear(self, pool: &mut FramePool) {
        self.store(pool, PageTableEntry::DEFAULT);
    }

    pub(crate) fn state(self, pool: &FramePool) -> PteState {
        let entry = self.load(pool);
        if entry.present() {
            assert!(
                !entry.paged_out(),
                "entry is both resident and on the backing store"
            );
            PteState::Resident {
                frame: FrameId::from_number(entry.page_frame_address().value()),
                writable: entry.read_write(),
                user: entry.user_supervisor(),
                accessed: entry.accessed(),
            }
        } else if entry.paged_out() {
            PteState::OnBackingStore {
                writable: entry.read_write(),
                user: entry.user_supervisor(),
            }
        } else {
            PteState::Absent
        }
    }
}

/// Locates the leaf entry for `va` without allocating. `None` when the
/// intermediate page table does not exist.
pub(crate) fn walk_lookup(pool: &FramePool, root: FrameId, va: usize) -> Option<PteLoc> {
    let addr = VirtualAddress::new_with_raw_value(va as u32);
    let dir_index = usize::from(addr.page_directory_index().value());
    let pde = PageDirectoryEntry::new_with_raw_value(entries(pool.frame(root))[dir_index]);
    if !pde.present() {
        return None;
    }
    Some(PteLoc {
        table: FrameId::from_number(pde.page_table_address().value()),
        index: usize::from(addr.page_table_index().value()),
    })
}

/// Locates the leaf entry for `va`, allocating and linking a zeroed
/// page-table page if the intermediate table is missing. The directory
/// entry gets generous permissions; the leaf bits are the enforcement
/// point.
pub(crate) fn walk_alloc(
    pool: &mut FramePool,
    root: FrameId,
    va: usize,
) -> Result<PteLoc, VmError> {
    let addr = VirtualAddress::new_with_raw_value(va as u32);
    let dir_index = usize::from(addr.page_directory_index().value());
    let pde = PageDirectoryEntry::new_with_raw_value(entries(pool.frame(root))[dir_index]);
    let table = if pde.present() {
        FrameId::from_number(pde.page_table_address().value())
    } else {
        let frame = pool.alloc()?;
        pool.frame_mut(frame).zero();
        pool.mark_table(frame);
        let pde = PageDirectoryEntry::DEFAULT
            .with_present(true)
            .with_read_write(true)
            .with_user_supervisor(true)
            .with_page_table_address(u20::new(frame.number()));
        entries_mut(pool.frame_mut(root))[dir_index] = pde.raw_value();
        frame
    };
    Ok(PteLoc {
        table,
        index: usize::from(addr.page_table_index().value()),
    })
}

/// Installs contiguous mappings for every page of `[va, va + size)`
/// onto physical addresses starting at `pa`. An already-present entry
/// means the bookkeeping elsewhere is corrupt, and panics.
pub(crate) fn map_range(
    pool: &mut FramePool,
    root: FrameId,
    va: usize,
    size: usize,
    pa: usize,
    writable: bool,
    user: bool,
) -> Result<(), VmError> {
    assert!(size > 0, "mapping an empty range");
    let mut a = page_round_down(va);
    let last = page_round_down(va + size - 1);
    let mut pa = pa;
    loop {
        let loc = walk_alloc(pool, root, a)?;
        assert!(!loc.load(pool).present(), "remap at {a:#x}");
        loc.store(
            pool,
            PageTableEntry::DEFAULT
                .with_present(true)
                .with_read_write(writable)
                .with_user_supervisor(user)
                .with_page_frame_address(u20::new((pa / PAGE_FRAME_SIZE) as u32)),
        );
        if a == last {
            break;
        }
        a += PAGE_FRAME_SIZE;
        pa += PAGE_FRAME_SIZE;
    }
    Ok(())
}

/// Brings a paged-out entry back to resident, pointing at `frame`.
/// The counterpart of [`set_paged_out`]; these two are the only
/// transitions between the resident and backing-store states.
pub(crate) fn set_resident(pool: &mut FramePool, loc: PteLoc, frame: FrameId) {
    let entry = loc.load(pool);
    assert!(!entry.present(), "remap at a resident entry");
    loc.store(
        pool,
        entry
            .with_present(true)
            .with_read_write(true)
            .with_user_supervisor(true)
            .with_paged_out(false)
            .with_page_frame_address(u20::new(frame.number())),
    );
}

/// Marks a resident entry as living on the backing store: clears
/// present and the now-stale frame address while preserving the flag
/// bits.
pub(crate) fn set_paged_out(pool: &mut FramePool, loc: PteLoc) {
    let entry = loc.load(pool);
    assert!(entry.present(), "paging out an entry that is not resident");
    loc.store(
        pool,
        entry
            .with_present(false)
            .with_paged_out(true)
            .with_page_frame_address(u20::new(0)),
    );
}

/// Installs a fresh paged-out entry (used when duplicating an address
/// space whose source page is on the backing store).
pub(crate) fn install_paged_out(
    pool: &mut FramePool,
    root: FrameId,
    va: usize,
    writable: bool,
    user: bool,
) -> Result<(), VmError> {
    let loc = walk_alloc(pool, root, va)?;
    assert!(!loc.load(pool).present(), "remap at {va:#x}");
    loc.store(
        pool,
        PageTableEntry::DEFAULT
            .with_paged_out(true)
            .with_read_write(writable)
            .with_user_supervisor(user),
    );
    Ok(())
}

/// Builds a fresh page directory seeded with the fixed kernel
/// mappings shared by every address space. On failure the partially
/// built tree is freed.
pub(crate) fn setup_kernel_map(pool: &mut FramePool) -> Result<FrameId, VmError> {
    let root = pool.alloc()?;
    pool.frame_mut(root).zero();
    pool.mark_table(root);
    for range in kernel_mapping_ranges() {
        let size = range.phys_end - range.phys_start;
        if let Err(e) = map_range(
            pool,
            root,
            range.virt,
            size,
            range.phys_start,
            range.writable,
            false,
        ) {
            free_table(pool, root);
            return Err(e);
        }
    }
    Ok(root)
}

/// Frees every linked page-table page, then the directory itself.
/// User frames must already have been released through shrinking.
pub(crate) fn free_table(pool: &mut FramePool, root: FrameId) {
    for dir_index in 0..ENTRY_COUNT {
        let pde =
            PageDirectoryEntry::new_with_raw_value(entries(pool.frame(root))[dir_index]);
        if pde.present() {
            pool.free(FrameId::from_number(pde.page_table_address().value()));
        }
    }
    pool.free(root);
}
