//! Platform-Level Interrupt Controller
//!
//! External interrupt routing for rv64. Context 1 is hart 0's S-mode
//! context on the QEMU-virt layout.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

static PLIC_BASE: AtomicU64 = AtomicU64::new(0x0C00_0000);

const PRIORITY_BASE: u64 = 0x0000;
const ENABLE_BASE: u64 = 0x2000;
const ENABLE_STRIDE: u64 = 0x80;
const CONTEXT_BASE: u64 = 0x20_0000;
const CONTEXT_STRIDE: u64 = 0x1000;
const CONTEXT_THRESHOLD: u64 = 0x0;
const CONTEXT_CLAIM: u64 = 0x4;

/// S-mode context number for a hart on the QEMU-virt layout.
fn s_context(hart: usize) -> u64 {
    1 + 2 * hart as u64
}

fn write_reg(off: u64, val: u32) {
    let base = PLIC_BASE.load(Ordering::Acquire);
    // SAFETY: PLIC registers are device memory at the platform base.
    unsafe {
        core::ptr::write_volatile(
            crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base + off)).as_u64() as *mut u32,
            val,
        );
    }
}

fn read_reg(off: u64) -> u32 {
    let base = PLIC_BASE.load(Ordering::Acquire);
    // SAFETY: as in `write_reg`.
    unsafe {
        core::ptr::read_volatile(
            crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base + off)).as_u64() as *const u32,
        )
    }
}

/// Record the base discovered in the device tree.
pub fn set_base(base: u64) {
    PLIC_BASE.store(base, Ordering::Release);
}

/// Accept all priorities on the hart's S context.
pub fn init(hart: usize) {
    write_reg(
        CONTEXT_BASE + s_context(hart) * CONTEXT_STRIDE + CONTEXT_THRESHOLD,
        0,
    );
}

/// Enable a source for the hart's S context at priority 1.
pub fn enable(hart: usize, source: u32) {
    write_reg(PRIORITY_BASE + source as u64 * 4, 1);
    let off = ENABLE_BASE + s_context(hart) * ENABLE_STRIDE + (source as u64 / 32) * 4;
    let cur = read_reg(off);
    write_reg(off, cur | 1 << (source % 32));
}

/// Disable a source for the hart's S context.
pub fn disable(hart: usize, source: u32) {
    let off = ENABLE_BASE + s_context(hart) * ENABLE_STRIDE + (source as u64 / 32) * 4;
    let cur = read_reg(off);
    write_reg(off, cur & !(1 << (source % 32)));
}

/// Claim the highest-priority pending source (0 = none).
pub fn claim(hart: usize) -> u32 {
    read_reg(CONTEXT_BASE + s_context(hart) * CONTEXT_STRIDE + CONTEXT_CLAIM)
}

/// Complete a previously claimed source.
pub fn complete(hart: usize, source: u32) {
    write_reg(
        CONTEXT_BASE + s_context(hart) * CONTEXT_STRIDE + CONTEXT_CLAIM,
        source,
    );
}
