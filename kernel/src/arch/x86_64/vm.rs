//! User page-table root management (x86_64)
//!
//! Kernel mappings live in a single canonical upper-half tree, captured at
//! bring-up; every user root aliases its kernel-half slots instead of
//! copying them.

use core::sync::atomic::{AtomicU64, Ordering};

/// Physical address of the canonical (boot) top-level table.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Record the canonical kernel root. Called once during bring-up, after
/// the boot page tables are final.
pub fn init_kernel_root(root_phys: u64) {
    KERNEL_ROOT.store(root_phys, Ordering::Release);
}

pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(Ordering::Acquire)
}

#[cfg(target_os = "none")]
mod real {
    use super::*;
    use crate::error::{KernelError, KernelResult};
    use crate::mm::{
        frame::{FrameIdx, FRAME_ALLOCATOR},
        frame_ptr,
        page_table::{PageTable, PAGE_TABLE_ENTRIES, USER_L4_ENTRIES},
        phys_to_virt, PhysAddr, PAGE_SIZE,
    };

    /// Allocate a fresh top-level table: user half empty, kernel half
    /// aliased from the canonical tree.
    pub fn new_user_root() -> KernelResult<u64> {
        let canonical = kernel_root();
        if canonical == 0 {
            return Err(KernelError::Busy);
        }
        let frame = FRAME_ALLOCATOR.lock().alloc_page()?;
        // SAFETY: fresh exclusive frame through the PMAP window.
        let new_table = unsafe { &mut *(frame_ptr(frame) as *mut PageTable) };
        new_table.zero();
        // SAFETY: the canonical root is a live table frame.
        let boot_table =
            unsafe { &*(phys_to_virt(PhysAddr::new(canonical)).as_u64() as *const PageTable) };
        for slot in USER_L4_ENTRIES..PAGE_TABLE_ENTRIES {
            new_table[slot] = boot_table[slot];
        }
        Ok(frame.phys_addr())
    }

    /// Load a space's root into CR3.
    ///
    /// # Safety
    ///
    /// `root_phys` must be a valid top-level table whose kernel half
    /// aliases the canonical tree; otherwise the next instruction fetch
    /// faults unrecoverably.
    pub unsafe fn switch_space(root_phys: u64) {
        use x86_64::{
            registers::control::{Cr3, Cr3Flags},
            structures::paging::PhysFrame,
            PhysAddr as HwPhysAddr,
        };
        // SAFETY: per the function contract.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(HwPhysAddr::new(root_phys)),
                Cr3Flags::empty(),
            );
        }
    }

    /// Copy one frame's contents into another through the PMAP window.
    pub fn copy_frame(dst: FrameIdx, src: FrameIdx) {
        // SAFETY: both frames are RAM under allocator management; dst is
        // exclusively owned by the caller, src is pinned by its refcount.
        unsafe {
            core::ptr::copy_nonoverlapping(frame_ptr(src), frame_ptr(dst), PAGE_SIZE);
        }
    }
}

#[cfg(target_os = "none")]
pub use real::{copy_frame, new_user_root, switch_space};
