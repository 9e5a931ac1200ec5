//! Kernel access to user memory. Copies walk the tables page by page,
//! faulting paged-out pages back in on the way.

use super::address_space::AddressSpace;
use super::error::VmError;
use super::frame_allocator::FrameId;
use super::page_table::{walk_lookup, PteState};
use super::swapping::{BackingStore, TranslationControl};
use super::Vm;
use swapcore_shared::mem::{page_round_down, PAGE_FRAME_SIZE};

impl<S: BackingStore, T: TranslationControl> Vm<S, T> {
    /// Copies `src` into the space's memory at `addr`. Fails without
    /// side effects on a range that is out of bounds; a store failure
    /// mid-copy leaves a prefix written.
    pub fn copy_to_user(
        &mut self,
        space: &mut AddressSpace,
        addr: usize,
        src: &[u8],
    ) -> Result<(), VmError> {
        self.check_user_range(space, addr, src.len())?;
        let mut copied = 0;
        while copied < src.len() {
            let a = addr + copied;
            let vpage = page_round_down(a);
            let offset = a - vpage;
            let chunk = (PAGE_FRAME_SIZE - offset).min(src.len() - copied);
            let frame = self.resolve_user_page(space, vpage, true)?;
            self.pool.frame_mut(frame).0[offset..offset + chunk]
                .copy_from_slice(&src[copied..copied + chunk]);
            copied += chunk;
        }
        Ok(())
    }

    /// Copies from the space's memory at `addr` into `dst`.
    pub fn copy_from_user(
        &mut self,
        space: &mut AddressSpace,
        addr: usize,
        dst: &mut [u8],
    ) -> Result<(), VmError> {
        self.check_user_range(space, addr, dst.len())?;
        let mut copied = 0;
        while copied < dst.len() {
            let a = addr + copied;
            let vpage = page_round_down(a);
            let offset = a - vpage;
            let chunk = (PAGE_FRAME_SIZE - offset).min(dst.len() - copied);
            let frame = self.resolve_user_page(space, vpage, false)?;
            dst[copied..copied + chunk]
                .copy_from_slice(&self.pool.frame(frame).0[offset..offset + chunk]);
            copied += chunk;
        }
        Ok(())
    }

    fn check_user_range(
        &self,
        space: &AddressSpace,
        addr: usize,
        len: usize,
    ) -> Result<(), VmError> {
        let end = addr.checked_add(len).ok_or(VmError::IllegalAccess)?;
        if end > space.size {
            return Err(VmError::IllegalAccess);
        }
        Ok(())
    }

    /// Resolves `vpage` to its frame, paging it in if needed, and marks
    /// the entry accessed so replacement sees kernel-side use too.
    fn resolve_user_page(
        &mut self,
        space: &mut AddressSpace,
        vpage: usize,
        write: bool,
    ) -> Result<FrameId, VmError> {
        let mut faulted = false;
        loop {
            let loc = walk_lookup(&self.pool, space.root, vpage).ok_or(VmError::IllegalAccess)?;
            match loc.state(&self.pool) {
                PteState::Resident {
                    frame,
                    writable,
                    user,
                    ..
                } => {
                    if !user || (write && !writable) {
                        return Err(VmError::IllegalAccess);
                    }
                    let entry = loc.load(&self.pool);
                    loc.store(&mut self.pool, entry.with_accessed(true));
                    return Ok(frame);
                }
                PteState::OnBackingStore { .. } if !faulted => {
                    self.handle_page_fault(space, vpage)?;
                    faulted = true;
                }
                PteState::OnBackingStore { .. } | PteState::Absent => {
                    return Err(VmError::IllegalAccess);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::page_replacement::ReplacementPolicy;
    use crate::mem::swapping::{MemBackingStore, NullTranslation};
    use crate::mem::page_table::map_range;

    fn test_vm() -> Vm<MemBackingStore, NullTranslation> {
        Vm::new(
            128,
            MemBackingStore::new(),
            NullTranslation,
            ReplacementPolicy::Lifo,
        )
        .expect("policy is implemented")
    }

    #[test]
    fn test_copy_spans_page_boundary() {
        let mut vm = test_vm();
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, 2 * PAGE_FRAME_SIZE).expect("within budget");

        let data: alloc::vec::Vec<u8> = (0..=255).collect();
        let addr = PAGE_FRAME_SIZE - 100;
        vm.copy_to_user(&mut space, addr, &data).expect("in bounds");
        let mut got = [0u8; 256];
        vm.copy_from_user(&mut space, addr, &mut got)
            .expect("in bounds");
        assert_eq!(&got[..], &data[..]);
        vm.teardown(space);
    }

    #[test]
    fn test_copy_rejects_out_of_bounds() {
        let mut vm = test_vm();
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, PAGE_FRAME_SIZE).expect("within budget");

        let mut buf = [0u8; 8];
        assert!(matches!(
            vm.copy_from_user(&mut space, PAGE_FRAME_SIZE - 4, &mut buf),
            Err(VmError::IllegalAccess)
        ));
        assert!(matches!(
            vm.copy_to_user(&mut space, usize::MAX - 2, &buf),
            Err(VmError::IllegalAccess)
        ));
        // A zero-length copy at the boundary is fine.
        vm.copy_to_user(&mut space, PAGE_FRAME_SIZE, &[])
            .expect("empty range");
        vm.teardown(space);
    }

    #[test]
    fn test_copy_marks_entry_accessed() {
        let mut vm = test_vm();
        let mut space = vm.create_space(false).expect("pool has room");
        vm.grow(&mut space, PAGE_FRAME_SIZE).expect("within budget");

        let mut buf = [0u8; 1];
        vm.copy_from_user(&mut space, 0, &mut buf).expect("in bounds");
        let loc = walk_lookup(&vm.pool, space.root, 0).expect("page is mapped");
        assert!(loc.load(&vm.pool).accessed());
        vm.teardown(space);
    }

    #[test]
    fn test_write_to_read_only_page_is_illegal() {
        let mut vm = test_vm();
        let mut space = vm.create_space(false).expect("pool has room");
        // Hand-build a read-only user mapping; the growth path only
        // ever creates writable ones.
        let frame = vm.pool.alloc().expect("pool has room");
        map_range(
            &mut vm.pool,
            space.root,
            0,
            PAGE_FRAME_SIZE,
            frame.index() * PAGE_FRAME_SIZE,
            false,
            true,
        )
        .expect("mapping succeeds");
        space.size = PAGE_FRAME_SIZE;

        let mut buf = [0u8; 4];
        vm.copy_from_user(&mut space, 0, &mut buf).expect("readable");
        assert!(matches!(
            vm.copy_to_user(&mut space, 0, &buf),
            Err(VmError::IllegalAccess)
        ));

        vm.pool.free(frame);
        space.size = 0;
        vm.teardown(space);
    }
}
