//! Victim selection for page replacement.

use super::address_space::AddressSpace;
use super::error::VmError;
use super::frame_allocator::FramePool;
use super::page_table::walk_lookup;

/// How an eviction victim is chosen among a process's resident pages.
/// Selected once when the [`super::Vm`] is constructed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplacementPolicy {
    /// Evict the page that became resident most recently.
    Lifo,
    /// FIFO by load order, but a page whose accessed bit is set gets a
    /// second chance: the bit is cleared and the page moves to the back
    /// of the order.
    SecondChanceFifo,
    /// Placeholder for a least-accessed policy. Selecting it is a
    /// configuration error.
    LeastAccessed,
}

impl ReplacementPolicy {
    pub(crate) fn validate(self) -> Result<Self, VmError> {
        match self {
            ReplacementPolicy::Lifo | ReplacementPolicy::SecondChanceFifo => Ok(self),
            ReplacementPolicy::LeastAccessed => Err(VmError::UnimplementedPolicy),
        }
    }
}

/// Picks the resident-table index of the next eviction victim. Panics
/// if the space has no resident page to evict, which means the caller's
/// occupancy accounting is corrupt.
pub(crate) fn select_victim(
    policy: ReplacementPolicy,
    pool: &mut FramePool,
    space: &mut AddressSpace,
) -> usize {
    match policy {
        ReplacementPolicy::Lifo => lifo_victim(space),
        ReplacementPolicy::SecondChanceFifo => second_chance_victim(pool, space),
        // Rejected when the manager was configured.
        ReplacementPolicy::LeastAccessed => unreachable!("policy was validated at construction"),
    }
}

fn lifo_victim(space: &AddressSpace) -> usize {
    space
        .resident
        .iter_used()
        .max_by_key(|(_, slot)| slot.load_order)
        .map(|(index, _)| index)
        .expect("no resident page to evict")
}

fn second_chance_victim(pool: &mut FramePool, space: &mut AddressSpace) -> usize {
    let root = space.root;
    loop {
        let (index, vpage) = space
            .resident
            .iter_used()
            .min_by_key(|(_, slot)| slot.load_order)
            .map(|(index, slot)| (index, slot.vpage))
            .expect("no resident page to evict");
        let loc = walk_lookup(pool, root, vpage).expect("resident page has no page table");
        let entry = loc.load(pool);
        if !entry.accessed() {
            return index;
        }
        // Referenced since the last pass: spare it once and move it to
        // the back of the order.
        loc.store(pool, entry.with_accessed(false));
        let stamp = space.next_stamp();
        space.resident.set_load_order(index, stamp);
    }
}

/// Folds the hardware accessed bits into the per-slot access counters,
/// clearing the bits so the next sampling window starts fresh.
/// Diagnostics for operational tooling and groundwork for a
/// frequency-based policy.
pub(crate) fn sample_access_bits(pool: &mut FramePool, space: &mut AddressSpace) {
    let root = space.root;
    for (_, slot) in space.resident.iter_used_mut() {
        let loc = walk_lookup(pool, root, slot.vpage).expect("resident page has no page table");
        let entry = loc.load(pool);
        if entry.accessed() {
            loc.store(pool, entry.with_accessed(false));
            slot.access_count += 1;
        }
    }
}
