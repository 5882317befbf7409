//! PSCI power control
//!
//! The firmware interface used to stop and reset the machine and to bring
//! secondary CPUs online. Whether calls go through HVC or SMC is announced
//! by the FADT ARM boot-architecture flags (or the device tree).

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{KernelError, KernelResult};

/// PSCI 0.2 function IDs.
const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
const PSCI_SYSTEM_RESET: u32 = 0x8400_0009;
const PSCI_CPU_ON: u32 = 0xC400_0003;

/// Whether the conduit is HVC (true) or SMC (false).
static USE_HVC: AtomicBool = AtomicBool::new(true);
/// Whether PSCI was announced by firmware at all.
static AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Record the conduit announced by firmware.
pub fn init(use_hvc: bool) {
    USE_HVC.store(use_hvc, Ordering::Release);
    AVAILABLE.store(true, Ordering::Release);
}

pub fn is_available() -> bool {
    AVAILABLE.load(Ordering::Acquire)
}

fn call(func: u32, arg0: u64, arg1: u64, arg2: u64) -> i64 {
    let ret: i64;
    if USE_HVC.load(Ordering::Acquire) {
        // SAFETY: PSCI calls trap to firmware; registers per SMCCC.
        unsafe {
            core::arch::asm!(
                "hvc #0",
                inout("x0") func as u64 => ret,
                in("x1") arg0,
                in("x2") arg1,
                in("x3") arg2,
            );
        }
    } else {
        // SAFETY: as above, through the secure monitor.
        unsafe {
            core::arch::asm!(
                "smc #0",
                inout("x0") func as u64 => ret,
                in("x1") arg0,
                in("x2") arg1,
                in("x3") arg2,
            );
        }
    }
    ret
}

/// Power the machine off. Does not return on success.
pub fn system_off() -> KernelResult<()> {
    if !is_available() {
        return Err(KernelError::NotSupported);
    }
    call(PSCI_SYSTEM_OFF, 0, 0, 0);
    Err(KernelError::Io)
}

/// Reset the machine. Does not return on success.
pub fn system_reset() -> KernelResult<()> {
    if !is_available() {
        return Err(KernelError::NotSupported);
    }
    call(PSCI_SYSTEM_RESET, 0, 0, 0);
    Err(KernelError::Io)
}

/// Start a secondary CPU at `entry`.
pub fn cpu_on(target_cpu: u64, entry: u64) -> KernelResult<()> {
    if !is_available() {
        return Err(KernelError::NotSupported);
    }
    match call(PSCI_CPU_ON, target_cpu, entry, 0) {
        0 => Ok(()),
        -2 => Err(KernelError::Invalid),
        -4 => Err(KernelError::AlreadyExists),
        _ => Err(KernelError::Io),
    }
}
