//! Local APIC and I/O APIC access
//!
//! Registers are reached through the PMAP window at their standard
//! physical bases (the MADT can override the I/O APIC base). All accessors
//! are no-ops on the host target.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

/// Local APIC MMIO physical base.
const LAPIC_BASE: u64 = 0xFEE0_0000;

const LAPIC_ID: u64 = 0x020;
const LAPIC_EOI: u64 = 0x0B0;
const LAPIC_SVR: u64 = 0x0F0;
const LAPIC_ESR: u64 = 0x280;
const LAPIC_ICR_LOW: u64 = 0x300;
const LAPIC_ICR_HIGH: u64 = 0x310;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;

/// ICR delivery: INIT.
const ICR_INIT: u32 = 0b101 << 8;
/// ICR delivery: start-up (SIPI).
const ICR_SIPI: u32 = 0b110 << 8;
/// ICR level assert.
const ICR_ASSERT: u32 = 1 << 14;
/// ICR delivery-status bit.
const ICR_PENDING: u32 = 1 << 12;

/// I/O APIC MMIO physical base; MADT may override.
static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0xFEC0_0000);

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;
const IOAPIC_REDTBL_BASE: u32 = 0x10;
const REDTBL_MASKED: u64 = 1 << 16;

/// Paravirtualized hosts may let us skip the LAPIC EOI write.
static EOI_ELIDED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Record an I/O APIC base discovered in the MADT.
pub fn set_ioapic_base(base: u64) {
    IOAPIC_BASE.store(base, Ordering::Release);
}

/// Enable paravirt EOI elision.
pub fn set_eoi_elided(elided: bool) {
    EOI_ELIDED.store(elided, Ordering::Release);
}

#[cfg(target_os = "none")]
fn lapic_read(reg: u64) -> u32 {
    let ptr = crate::mm::phys_to_virt(crate::mm::PhysAddr::new(LAPIC_BASE + reg)).as_u64()
        as *const u32;
    // SAFETY: LAPIC registers are device memory at a fixed base, mapped
    // uncacheable through the PMAP.
    unsafe { core::ptr::read_volatile(ptr) }
}

#[cfg(target_os = "none")]
fn lapic_write(reg: u64, val: u32) {
    let ptr =
        crate::mm::phys_to_virt(crate::mm::PhysAddr::new(LAPIC_BASE + reg)).as_u64() as *mut u32;
    // SAFETY: as in `lapic_read`.
    unsafe { core::ptr::write_volatile(ptr, val) }
}

/// Local APIC ID of the executing CPU.
pub fn local_apic_id() -> u8 {
    #[cfg(target_os = "none")]
    {
        (lapic_read(LAPIC_ID) >> 24) as u8
    }
    #[cfg(not(target_os = "none"))]
    0
}

/// Software-enable the local APIC with the given spurious vector.
pub fn enable_local_apic(spurious_vector: u8) {
    #[cfg(target_os = "none")]
    lapic_write(LAPIC_SVR, SVR_ENABLE | spurious_vector as u32);
    #[cfg(not(target_os = "none"))]
    let _ = spurious_vector;
}

/// Signal end-of-interrupt to the local APIC.
pub fn send_eoi() {
    #[cfg(target_os = "none")]
    if !EOI_ELIDED.load(Ordering::Acquire) {
        lapic_write(LAPIC_EOI, 0);
    }
}

/// Send a fixed-delivery IPI carrying `vector` to the CPU with `apic_id`.
pub fn send_ipi(apic_id: u8, vector: u8) {
    #[cfg(target_os = "none")]
    {
        lapic_write(LAPIC_ICR_HIGH, (apic_id as u32) << 24);
        lapic_write(LAPIC_ICR_LOW, ICR_ASSERT | vector as u32);
        while lapic_read(LAPIC_ICR_LOW) & ICR_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = (apic_id, vector);
}

/// INIT/SIPI sequence to wake an application processor.
///
/// `entry_frame` is the page number of the real-mode trampoline.
pub fn send_init_sipi(apic_id: u8, entry_frame: u8) {
    #[cfg(target_os = "none")]
    {
        lapic_write(LAPIC_ESR, 0);
        lapic_write(LAPIC_ICR_HIGH, (apic_id as u32) << 24);
        lapic_write(LAPIC_ICR_LOW, ICR_INIT | ICR_ASSERT);
        while lapic_read(LAPIC_ICR_LOW) & ICR_PENDING != 0 {
            core::hint::spin_loop();
        }
        for _ in 0..2 {
            lapic_write(LAPIC_ICR_HIGH, (apic_id as u32) << 24);
            lapic_write(LAPIC_ICR_LOW, ICR_SIPI | ICR_ASSERT | entry_frame as u32);
            while lapic_read(LAPIC_ICR_LOW) & ICR_PENDING != 0 {
                core::hint::spin_loop();
            }
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = (apic_id, entry_frame);
}

#[cfg(target_os = "none")]
fn ioapic_write(reg: u32, val: u32) {
    let base = IOAPIC_BASE.load(Ordering::Acquire);
    // SAFETY: IOREGSEL/IOWIN are device registers at the discovered base.
    unsafe {
        let sel = crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base + IOREGSEL)).as_u64()
            as *mut u32;
        let win =
            crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base + IOWIN)).as_u64() as *mut u32;
        core::ptr::write_volatile(sel, reg);
        core::ptr::write_volatile(win, val);
    }
}

/// Route a global system interrupt to `vector` on the CPU with `apic_id`,
/// unmasked, edge-triggered, active-high.
pub fn route_gsi(gsi: u32, vector: u8, apic_id: u8) {
    #[cfg(target_os = "none")]
    {
        let reg = IOAPIC_REDTBL_BASE + gsi * 2;
        ioapic_write(reg + 1, (apic_id as u32) << 24);
        ioapic_write(reg, vector as u32);
    }
    #[cfg(not(target_os = "none"))]
    let _ = (gsi, vector, apic_id);
}

/// Mask a global system interrupt in the I/O APIC.
pub fn mask_gsi(gsi: u32) {
    #[cfg(target_os = "none")]
    ioapic_write(IOAPIC_REDTBL_BASE + gsi * 2, REDTBL_MASKED as u32);
    #[cfg(not(target_os = "none"))]
    let _ = gsi;
}
