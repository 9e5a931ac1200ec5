use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Error type for virtual-memory operations.
///
/// Every variant is a recoverable failure reported to the immediate
/// caller. Bookkeeping corruption (remapping a present entry, a hole
/// below an address space's recorded size, a victim that is not
/// resident) is never an error value: it panics at the point of
/// detection, because continuing would risk silent corruption across
/// process boundaries.
pub enum VmError {
    /// The physical frame allocator has no free frame.
    OutOfFrames,
    /// Growing would exceed the per-process total page budget.
    PageBudgetExceeded,
    /// Growing would cross into the kernel half of the address space.
    AboveUserLimit,
    /// The selected replacement policy is a placeholder with no
    /// implementation.
    UnimplementedPolicy,
    /// An access faulted on a page that is neither resident nor on the
    /// backing store, or violated the entry's permission bits.
    IllegalAccess,
    /// The backing store failed to read or write a page.
    BackingStore,
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "OutOfFrames"),
            VmError::PageBudgetExceeded => write!(f, "PageBudgetExceeded"),
            VmError::AboveUserLimit => write!(f, "AboveUserLimit"),
            VmError::UnimplementedPolicy => write!(f, "UnimplementedPolicy"),
            VmError::IllegalAccess => write!(f, "IllegalAccess"),
            VmError::BackingStore => write!(f, "BackingStore"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::OutOfFrames => write!(f, "no free physical frame"),
            VmError::PageBudgetExceeded => write!(f, "process page budget exceeded"),
            VmError::AboveUserLimit => write!(f, "growth past the user address limit"),
            VmError::UnimplementedPolicy => write!(f, "replacement policy is not implemented"),
            VmError::IllegalAccess => write!(f, "illegal user memory access"),
            VmError::BackingStore => write!(f, "backing store I/O failed"),
        }
    }
}

impl Error for VmError {}
