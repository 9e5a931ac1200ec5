use super::frame_allocator::FrameId;
use super::{BACKING_CAPACITY, RESIDENT_CAPACITY};
use core::fmt;

/// Identifies one address space for the lifetime of the system. Ids
/// are assigned monotonically and never reused, and key the backing
/// store together with the virtual page address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpaceId(pub(crate) u32);

impl SpaceId {
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Bookkeeping for one resident swappable page.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResidentSlot {
    pub vpage: usize,
    pub load_order: u64,
    pub access_count: u64,
}

/// Fixed-capacity table of the pages currently resident for one
/// address space. At most one slot per virtual page.
#[derive(Clone)]
pub(crate) struct ResidentTable {
    slots: [Option<ResidentSlot>; RESIDENT_CAPACITY],
}

impl ResidentTable {
    pub fn new() -> Self {
        Self {
            slots: [None; RESIDENT_CAPACITY],
        }
    }

    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn has_room(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    pub fn get(&self, index: usize) -> Option<&ResidentSlot> {
        self.slots[index].as_ref()
    }

    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &ResidentSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|slot| (i, slot)))
    }

    pub fn iter_used_mut(&mut self) -> impl Iterator<Item = (usize, &mut ResidentSlot)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|slot| (i, slot)))
    }

    pub fn insert(&mut self, vpage: usize, load_order: u64) {
        assert!(
            !self.slots.iter().flatten().any(|s| s.vpage == vpage),
            "virtual page {vpage:#x} is already resident"
        );
        let free = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .expect("resident table overflow");
        *free = Some(ResidentSlot {
            vpage,
            load_order,
            access_count: 0,
        });
    }

    /// Hands an existing slot over to a different page, as happens when
    /// a fault-in displaces the victim occupying the slot.
    pub fn replace(&mut self, index: usize, vpage: usize, load_order: u64) {
        assert!(
            !self.slots.iter().flatten().any(|s| s.vpage == vpage),
            "virtual page {vpage:#x} is already resident"
        );
        self.slots[index] = Some(ResidentSlot {
            vpage,
            load_order,
            access_count: 0,
        });
    }

    pub fn set_load_order(&mut self, index: usize, load_order: u64) {
        if let Some(slot) = self.slots[index].as_mut() {
            slot.load_order = load_order;
        }
    }

    pub fn clear_index(&mut self, index: usize) {
        self.slots[index] = None;
    }

    /// Removes the slot for `vpage` if present; false when untracked.
    pub fn remove(&mut self, vpage: usize) -> bool {
        for slot in &mut self.slots {
            if slot.is_some_and(|s| s.vpage == vpage) {
                *slot = None;
                return true;
            }
        }
        false
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BackingSlot {
    pub vpage: usize,
}

/// Fixed-capacity table of the pages currently on the backing store.
/// The store itself is keyed by `(SpaceId, vpage)`; this table exists
/// for budget accounting and diagnostics.
#[derive(Clone)]
pub(crate) struct BackingTable {
    slots: [Option<BackingSlot>; BACKING_CAPACITY],
}

impl BackingTable {
    pub fn new() -> Self {
        Self {
            slots: [None; BACKING_CAPACITY],
        }
    }

    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter_used(&self) -> impl Iterator<Item = &BackingSlot> {
        self.slots.iter().flatten()
    }

    pub fn insert(&mut self, vpage: usize) {
        assert!(
            !self.slots.iter().flatten().any(|s| s.vpage == vpage),
            "virtual page {vpage:#x} is already on the backing store"
        );
        let free = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .expect("backing-store table overflow");
        *free = Some(BackingSlot { vpage });
    }

    pub fn remove(&mut self, vpage: usize) -> bool {
        for slot in &mut self.slots {
            if slot.is_some_and(|s| s.vpage == vpage) {
                *slot = None;
                return true;
            }
        }
        false
    }
}

/// One process's address space: the root page-directory frame, the
/// highest mapped user address, and the swap bookkeeping. The page
/// frames referenced from the tables are owned exclusively by this
/// object; all mutation goes through [`super::Vm`].
///
/// Mutating operations on one address space must be mutually exclusive
/// with each other and with that process's own fault handling; callers
/// wrap each `AddressSpace` in a [`crate::sync::TicketLock`].
pub struct AddressSpace {
    pub(crate) id: SpaceId,
    pub(crate) root: FrameId,
    pub(crate) size: usize,
    pub(crate) privileged: bool,
    pub(crate) resident: ResidentTable,
    pub(crate) on_store: BackingTable,
    pub(crate) load_order: u64,
    pub(crate) fault_count: u64,
    pub(crate) paged_out_count: u64,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId, root: FrameId, privileged: bool) -> Self {
        Self {
            id,
            root,
            size: 0,
            privileged,
            resident: ResidentTable::new(),
            on_store: BackingTable::new(),
            load_order: 0,
            fault_count: 0,
            paged_out_count: 0,
        }
    }

    /// A child space sharing the parent's layout: bookkeeping tables
    /// and load-order stamps carry over so the replacement policy sees
    /// the same history, diagnostics counters start fresh.
    pub(crate) fn inherit(id: SpaceId, root: FrameId, parent: &AddressSpace) -> Self {
        Self {
            id,
            root,
            size: parent.size,
            privileged: parent.privileged,
            resident: parent.resident.clone(),
            on_store: parent.on_store.clone(),
            load_order: parent.load_order,
            fault_count: 0,
            paged_out_count: 0,
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub(crate) fn next_stamp(&mut self) -> u64 {
        let stamp = self.load_order;
        self.load_order += 1;
        stamp
    }

    pub fn stats(&self) -> SpaceStats {
        SpaceStats {
            size: self.size,
            resident_used: self.resident.used(),
            on_store_used: self.on_store.used(),
            fault_count: self.fault_count,
            paged_out_count: self.paged_out_count,
        }
    }

    /// Resident swappable pages, for operational tooling.
    pub fn resident_pages(&self) -> impl Iterator<Item = ResidentPage> + '_ {
        self.resident.iter_used().map(|(_, slot)| ResidentPage {
            vpage: slot.vpage,
            load_order: slot.load_order,
            access_count: slot.access_count,
        })
    }

    /// Virtual page addresses currently on the backing store.
    pub fn paged_out_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.on_store.iter_used().map(|slot| slot.vpage)
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} size {:#x}", self.id, self.size)?;
        writeln!(f, "  resident:")?;
        for page in self.resident_pages() {
            writeln!(
                f,
                "    vpage {:#x} load {} accesses {}",
                page.vpage, page.load_order, page.access_count
            )?;
        }
        writeln!(f, "  on backing store:")?;
        for vpage in self.paged_out_pages() {
            writeln!(f, "    vpage {vpage:#x}")?;
        }
        Ok(())
    }
}

/// Read-only diagnostic for one resident page.
#[derive(Clone, Copy, Debug)]
pub struct ResidentPage {
    pub vpage: usize,
    pub load_order: u64,
    pub access_count: u64,
}

/// Occupancy and fault counters for one address space.
#[derive(Clone, Copy, Debug)]
pub struct SpaceStats {
    pub size: usize,
    pub resident_used: usize,
    pub on_store_used: usize,
    pub fault_count: u64,
    pub paged_out_count: u64,
}
