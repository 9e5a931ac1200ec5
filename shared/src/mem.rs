use crate::sizes::MB;

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4096;
// One page-directory entry maps 4MB worth of leaf entries.
pub const HUGE_PAGE_SIZE: usize = 4 * MB;

// Any virtual address at or above OFFSET is a kernel address; user
// address spaces may never grow across it.
pub const OFFSET: usize = 0x8000_0000;

// Physical layout of the machine, in the classic PC arrangement:
// everything below EXTMEM is legacy I/O space, the kernel image is
// linked at KERNEL_LINK and its read-only part ends at KERNEL_DATA,
// usable RAM ends at PHYS_TOP, and memory-mapped devices sit in the
// window from DEVICE_SPACE up to 4GB.
pub const EXTMEM: usize = MB;
pub const KERNEL_LINK: usize = OFFSET + EXTMEM;
pub const KERNEL_DATA: usize = OFFSET + 4 * MB;
pub const PHYS_TOP: usize = 16 * MB;
pub const DEVICE_SPACE: usize = 0xFE00_0000;
pub const ADDRESS_SPACE_END: usize = 0x1_0000_0000;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_FRAME_SIZE - 1) & !(PAGE_FRAME_SIZE - 1)
}
