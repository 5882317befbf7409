//! Syscon power control
//!
//! The QEMU-virt test device: magic writes stop or reset the machine.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};

static SYSCON_BASE: AtomicU64 = AtomicU64::new(0x10_0000);
static AVAILABLE: AtomicBool = AtomicBool::new(false);

const SYSCON_POWEROFF: u32 = 0x5555;
const SYSCON_REBOOT: u32 = 0x7777;

/// Record the syscon base discovered in the device tree.
pub fn init(base: u64) {
    SYSCON_BASE.store(base, Ordering::Release);
    AVAILABLE.store(true, Ordering::Release);
}

pub fn is_available() -> bool {
    AVAILABLE.load(Ordering::Acquire)
}

fn write_magic(val: u32) {
    let base = SYSCON_BASE.load(Ordering::Acquire);
    // SAFETY: the syscon register is device memory at the platform base.
    unsafe {
        core::ptr::write_volatile(
            crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base)).as_u64() as *mut u32,
            val,
        );
    }
}

/// Power the machine off. Does not return on success.
pub fn poweroff() -> KernelResult<()> {
    if !is_available() {
        return Err(KernelError::NotSupported);
    }
    write_magic(SYSCON_POWEROFF);
    Err(KernelError::Io)
}

/// Reset the machine. Does not return on success.
pub fn reboot() -> KernelResult<()> {
    if !is_available() {
        return Err(KernelError::NotSupported);
    }
    write_magic(SYSCON_REBOOT);
    Err(KernelError::Io)
}
