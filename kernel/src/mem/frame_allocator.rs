// Frame numbers are array indices into a pool that is far smaller than
// u32::MAX, so the usize -> u32 casts below cannot truncate.
#![allow(clippy::cast_possible_truncation)]

use super::error::VmError;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use bitbybit::bitfield;
use swapcore_shared::mem::PAGE_FRAME_SIZE;

/// Identifies one physical frame. For frames handed out by the pool
/// this is also the pool index; entries covering the fixed kernel
/// ranges carry raw bus frame numbers that are never dereferenced
/// through the pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameId(u32);

impl FrameId {
    pub(crate) const fn from_number(number: u32) -> Self {
        Self(number)
    }

    pub const fn number(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    table: bool,
}

/// One physical page frame worth of memory.
#[repr(align(4096))]
#[derive(Clone)]
pub struct Page(pub [u8; PAGE_FRAME_SIZE]);

impl Page {
    pub const ZERO: Page = Page([0; PAGE_FRAME_SIZE]);

    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

/// The machine's physical page frames plus a core map tracking which
/// are handed out. Placement is next-fit over single frames. Freed
/// frames keep their previous contents; callers that need a clean page
/// zero it themselves.
pub struct FramePool {
    frames: Vec<Page>,
    core_map: Box<[CoreMapEntry]>,
    position: usize,
    allocated: usize,
}

impl FramePool {
    pub fn new(total_frames: usize) -> Self {
        Self {
            frames: vec![Page::ZERO; total_frames],
            core_map: vec![CoreMapEntry::DEFAULT; total_frames].into_boxed_slice(),
            position: 0,
            allocated: 0,
        }
    }

    pub fn alloc(&mut self) -> Result<FrameId, VmError> {
        let total = self.core_map.len();
        for step in 0..total {
            let i = (self.position + step) % total;
            if !self.core_map[i].allocated() {
                self.core_map[i] = self.core_map[i].with_allocated(true);
                self.position = (i + 1) % total;
                self.allocated += 1;
                return Ok(FrameId(i as u32));
            }
        }
        Err(VmError::OutOfFrames)
    }

    pub fn free(&mut self, frame: FrameId) {
        let i = frame.index();
        assert!(
            self.core_map[i].allocated(),
            "freeing a frame that is not allocated"
        );
        self.core_map[i] = CoreMapEntry::DEFAULT;
        self.allocated -= 1;
    }

    /// Marks a frame as holding a page-table page. Diagnostic only.
    pub(crate) fn mark_table(&mut self, frame: FrameId) {
        let i = frame.index();
        self.core_map[i] = self.core_map[i].with_table(true);
    }

    pub fn frame(&self, frame: FrameId) -> &Page {
        &self.frames[frame.index()]
    }

    pub fn frame_mut(&mut self, frame: FrameId) -> &mut Page {
        &mut self.frames[frame.index()]
    }

    /// Copies the contents of `src` into `dst`.
    pub(crate) fn copy(&mut self, src: FrameId, dst: FrameId) {
        assert_ne!(src, dst, "copying a frame onto itself");
        let (a, b) = (src.index(), dst.index());
        if a < b {
            let (lo, hi) = self.frames.split_at_mut(b);
            hi[0].0.copy_from_slice(&lo[a].0);
        } else {
            let (lo, hi) = self.frames.split_at_mut(a);
            lo[b].0.copy_from_slice(&hi[0].0);
        }
    }

    pub fn frames_allocated(&self) -> usize {
        self.allocated
    }

    pub fn frames_free(&self) -> usize {
        self.core_map.len() - self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let mut pool = FramePool::new(4);
        for expected in 0..4 {
            let frame = pool.alloc().expect("pool has room");
            assert_eq!(frame.number(), expected);
        }
        assert_eq!(pool.frames_free(), 0);
        assert!(matches!(pool.alloc(), Err(VmError::OutOfFrames)));
    }

    #[test]
    fn test_next_fit_resumes_past_freed_frames() {
        let mut pool = FramePool::new(4);
        let a = pool.alloc().expect("pool has room");
        let _b = pool.alloc().expect("pool has room");
        pool.free(a);
        // Next-fit continues from the scan position rather than
        // immediately reusing the lowest free frame.
        let c = pool.alloc().expect("pool has room");
        assert_eq!(c.number(), 2);
        let d = pool.alloc().expect("pool has room");
        assert_eq!(d.number(), 3);
        let e = pool.alloc().expect("wraps around to the freed frame");
        assert_eq!(e.number(), 0);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_double_free_panics() {
        let mut pool = FramePool::new(2);
        let frame = pool.alloc().expect("pool has room");
        pool.free(frame);
        pool.free(frame);
    }

    #[test]
    fn test_copy_between_frames() {
        let mut pool = FramePool::new(3);
        let src = pool.alloc().expect("pool has room");
        let dst = pool.alloc().expect("pool has room");
        pool.frame_mut(src).0.fill(0xAB);
        pool.copy(src, dst);
        assert!(pool.frame(dst).0.iter().all(|&b| b == 0xAB));
        // And in the other index direction.
        pool.frame_mut(dst).0.fill(0xCD);
        pool.copy(dst, src);
        assert!(pool.frame(src).0.iter().all(|&b| b == 0xCD));
    }
}
