//! User page-table root management (rv64, Sv48)
//!
//! The kernel half occupies the upper part of every root table; fresh
//! user roots alias those slots from the canonical boot tree.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::mm::{
    frame::{FrameIdx, FRAME_ALLOCATOR},
    frame_ptr,
    page_table::{PageTable, PAGE_TABLE_ENTRIES, USER_L4_ENTRIES},
    phys_to_virt, PhysAddr, PAGE_SIZE,
};

/// satp mode field for Sv48.
const SATP_MODE_SV48: u64 = 9 << 60;

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Record the canonical kernel root. Called once during bring-up.
pub fn init_kernel_root(root_phys: u64) {
    KERNEL_ROOT.store(root_phys, Ordering::Release);
}

/// Allocate a fresh root: user half empty, kernel half aliased.
pub fn new_user_root() -> KernelResult<u64> {
    let canonical = KERNEL_ROOT.load(Ordering::Acquire);
    if canonical == 0 {
        return Err(KernelError::Busy);
    }
    let frame = FRAME_ALLOCATOR.lock().alloc_page()?;
    // SAFETY: fresh exclusive frame via the PMAP window.
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

/// Load a space's root into satp.
///
/// # Safety
///
/// `root_phys` must be a valid Sv48 root whose kernel half aliases the
/// canonical tree.
pub unsafe fn switch_space(root_phys: u64) {
    let satp = SATP_MODE_SV48 | (root_phys / PAGE_SIZE as u64);
    // SAFETY: per the function contract; the fence orders translations.
    unsafe {
        core::arch::asm!(
            "csrw satp, {}",
            "sfence.vma zero, zero",
            in(reg) satp,
        );
    }
}

/// Copy one frame's contents into another through the PMAP window.
pub fn copy_frame(dst: FrameIdx, src: FrameIdx) {
    // SAFETY: both frames are RAM under allocator management; dst is
    // exclusively owned, src pinned by its refcount.
    unsafe {
        core::ptr::copy_nonoverlapping(frame_ptr(src), frame_ptr(dst), PAGE_SIZE);
    }
}
