// https://wiki.osdev.org/Paging
//
// Two-level 32-bit paging: a page directory of 1024 entries, each
// pointing at a page table of 1024 entries, each mapping one 4KB frame.

use crate::mem::{
    ADDRESS_SPACE_END, DEVICE_SPACE, EXTMEM, KERNEL_DATA, KERNEL_LINK, OFFSET, PHYS_TOP,
};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;

/// Entries per page directory or page table.
pub const ENTRY_COUNT: usize = 1024;

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

/// A leaf entry. Bits 0-8 are defined by the hardware; bit 9 is one of
/// the OS-available bits and marks a page whose contents currently live
/// on the backing store. `present` and `paged_out` are mutually
/// exclusive: a set `paged_out` bit on a not-present entry is what
/// distinguishes a demand-paging fault from an illegal access.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(9, rw)]
    paged_out: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

/// One contiguous kernel mapping: virtual addresses starting at `virt`
/// cover physical `phys_start..phys_end`. Permissions here are advisory
/// upper bounds; the installed entry bits are what the hardware checks.
#[derive(Clone, Copy)]
pub struct MappingRange {
    pub virt: usize,
    pub phys_start: usize,
    pub phys_end: usize,
    pub writable: bool,
}

/// The kernel half of every address space: the legacy I/O window, the
/// kernel's text and read-only data, the kernel data plus free RAM
/// window, and the memory-mapped device window.
pub fn kernel_mapping_ranges() -> [MappingRange; 4] {
    [
        MappingRange {
            virt: OFFSET,
            phys_start: 0,
            phys_end: EXTMEM,
            writable: true,
        },
        MappingRange {
            virt: KERNEL_LINK,
            phys_start: EXTMEM,
            phys_end: KERNEL_DATA - OFFSET,
            writable: false,
        },
        MappingRange {
            virt: KERNEL_DATA,
            phys_start: KERNEL_DATA - OFFSET,
            phys_end: PHYS_TOP,
            writable: true,
        },
        MappingRange {
            virt: DEVICE_SPACE,
            phys_start: DEVICE_SPACE,
            phys_end: ADDRESS_SPACE_END,
            writable: true,
        },
    ]
}
