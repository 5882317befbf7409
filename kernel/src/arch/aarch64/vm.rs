//! User translation-table management (AArch64)
//!
//! User mappings translate through TTBR0 while the kernel half lives in
//! TTBR1, so a fresh user root is an empty table; no kernel slots are
//! copied.

use crate::error::KernelResult;
use crate::mm::frame::{FrameIdx, FRAME_ALLOCATOR};

/// Allocate an empty top-level user table.
pub fn new_user_root() -> KernelResult<u64> {
    let frame = FRAME_ALLOCATOR.lock().alloc_page()?;
    // SAFETY: fresh exclusive frame via the PMAP window.
    unsafe {
        core::ptr::write_bytes(crate::mm::frame_ptr(frame), 0, crate::mm::PAGE_SIZE);
    }
    Ok(frame.phys_addr())
}

/// Load a space's root into TTBR0_EL1.
///
/// # Safety
///
/// `root_phys` must be a valid translation table.
pub unsafe fn switch_space(root_phys: u64) {
    // SAFETY: per the function contract; the barrier orders the write
    // against subsequent translations.
    unsafe {
        core::arch::asm!(
            "msr ttbr0_el1, {}",
            "isb",
            in(reg) root_phys,
        );
    }
    super::tlb_flush_all();
}

/// Copy one frame's contents into another through the PMAP window.
pub fn copy_frame(dst: FrameIdx, src: FrameIdx) {
    // SAFETY: both frames are RAM under allocator management; dst is
    // exclusively owned, src pinned by its refcount.
    unsafe {
        core::ptr::copy_nonoverlapping(
            crate::mm::frame_ptr(src),
            crate::mm::frame_ptr(dst),
            crate::mm::PAGE_SIZE,
        );
    }
}
