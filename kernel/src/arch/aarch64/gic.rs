//! GICv2 interrupt controller
//!
//! Distributor + CPU interface at the QEMU-virt addresses. The MSI doorbell
//! address handed to PCI devices is read from the distributor's GICD_SETSPI
//! region when a GICv2m frame is present.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

/// Distributor base.
static GICD_BASE: AtomicU64 = AtomicU64::new(0x0800_0000);
/// CPU interface base.
static GICC_BASE: AtomicU64 = AtomicU64::new(0x0801_0000);
/// GICv2m MSI frame base (0 when absent).
static GICM_BASE: AtomicU64 = AtomicU64::new(0);

const GICD_CTLR: u64 = 0x000;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_SGIR: u64 = 0xF00;

const GICC_CTLR: u64 = 0x00;
const GICC_PMR: u64 = 0x04;
const GICC_IAR: u64 = 0x0C;
const GICC_EOIR: u64 = 0x10;

/// GICv2m MSI_SETSPI register offset.
const GICM_SETSPI: u64 = 0x040;

fn mmio_write(base: u64, off: u64, val: u32) {
    // SAFETY: fixed platform device registers, volatile access only.
    unsafe {
        core::ptr::write_volatile(
            crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base + off)).as_u64() as *mut u32,
            val,
        );
    }
}

fn mmio_read(base: u64, off: u64) -> u32 {
    // SAFETY: as in `mmio_write`.
    unsafe {
        core::ptr::read_volatile(
            crate::mm::phys_to_virt(crate::mm::PhysAddr::new(base + off)).as_u64() as *const u32,
        )
    }
}

/// Record bases discovered from the device tree.
pub fn set_bases(gicd: u64, gicc: u64, gicm: u64) {
    GICD_BASE.store(gicd, Ordering::Release);
    GICC_BASE.store(gicc, Ordering::Release);
    GICM_BASE.store(gicm, Ordering::Release);
}

/// Enable forwarding in the distributor and CPU interface.
pub fn init() {
    let gicd = GICD_BASE.load(Ordering::Acquire);
    let gicc = GICC_BASE.load(Ordering::Acquire);
    mmio_write(gicd, GICD_CTLR, 1);
    mmio_write(gicc, GICC_PMR, 0xFF);
    mmio_write(gicc, GICC_CTLR, 1);
}

/// Enable an interrupt ID and target it at CPU 0.
pub fn enable_irq(intid: u32) {
    let gicd = GICD_BASE.load(Ordering::Acquire);
    mmio_write(gicd, GICD_ISENABLER + (intid as u64 / 32) * 4, 1 << (intid % 32));
    // Byte-granular target register: route to CPU interface 0.
    let tgt_off = GICD_ITARGETSR + (intid as u64 & !3);
    let shift = (intid % 4) * 8;
    let cur = mmio_read(gicd, tgt_off);
    mmio_write(gicd, tgt_off, cur | (1 << shift));
}

/// Disable an interrupt ID.
pub fn disable_irq(intid: u32) {
    let gicd = GICD_BASE.load(Ordering::Acquire);
    mmio_write(gicd, GICD_ICENABLER + (intid as u64 / 32) * 4, 1 << (intid % 32));
}

/// Set the priority of an interrupt ID (0x00 highest).
pub fn set_priority(intid: u32, priority: u8) {
    let gicd = GICD_BASE.load(Ordering::Acquire);
    let off = GICD_IPRIORITYR + (intid as u64 & !3);
    let shift = (intid % 4) * 8;
    let cur = mmio_read(gicd, off) & !(0xFF << shift);
    mmio_write(gicd, off, cur | (priority as u32) << shift);
}

/// Acknowledge the highest-priority pending interrupt; returns its ID.
pub fn acknowledge() -> u32 {
    mmio_read(GICC_BASE.load(Ordering::Acquire), GICC_IAR) & 0x3FF
}

/// Signal end-of-interrupt for an acknowledged ID.
pub fn eoi(intid: u32) {
    mmio_write(GICC_BASE.load(Ordering::Acquire), GICC_EOIR, intid);
}

/// Send a software-generated interrupt to one CPU.
pub fn send_sgi(cpu: usize, sgi_id: u8) {
    let gicd = GICD_BASE.load(Ordering::Acquire);
    mmio_write(
        gicd,
        GICD_SGIR,
        ((1u32 << cpu) << 16) | (sgi_id as u32 & 0xF),
    );
}

/// MSI doorbell address for PCI devices, if a GICv2m frame exists.
pub fn msi_doorbell() -> Option<u64> {
    let gicm = GICM_BASE.load(Ordering::Acquire);
    (gicm != 0).then_some(gicm + GICM_SETSPI)
}
