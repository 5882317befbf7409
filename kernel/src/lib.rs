//! VermilionOS kernel library
//!
//! A small UNIX-like kernel core: refcounted physical frames, per-process
//! address spaces with copy-on-write fork, native/MSI/MSI-X interrupt
//! routing, a trap dispatcher feeding signals and the syscall table, the
//! process/thread/ptrace model, and an ACPI/AML subset for power control
//! and platform enumeration.
//!
//! The crate builds `no_std` for bare-metal targets and as a normal host
//! crate for unit tests; hardware-touching paths are gated on
//! `target_os = "none"`.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host target: link std and use the system allocator so unit tests can
// allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
#[global_allocator]
static ALLOCATOR: heap::BumpAllocator = heap::BumpAllocator::new();

/// Hand the carved heap range to the allocator.
///
/// # Safety
///
/// `start_virt` must map `len` bytes of exclusively-owned RAM.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn init_heap(start_virt: u64, len: usize) {
    // SAFETY: per the function contract.
    unsafe {
        ALLOCATOR.lock().init(start_virt as *mut u8, len);
    }
}

use core::sync::atomic::{AtomicU64, Ordering};

#[macro_use]
pub mod print;

pub mod acpi;
pub mod arch;
pub mod boot;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod power;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod trap;

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
mod heap;

/// Timer tick frequency the time-keeping syscalls assume.
pub const TICKS_PER_SEC: u64 = 100;

/// Monotonic tick counter, bumped by the timer interrupt.
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICK_COUNT.load(Ordering::Acquire)
}

/// Timer-interrupt body: account a tick and ask for a reschedule.
pub fn timer_tick() {
    TICK_COUNT.fetch_add(1, Ordering::AcqRel);
    sched::this_cpu().set_must_resched();
}

/// Bring the kernel up from the normalized boot information.
///
/// Globals initialize in a fixed order: console and logger first, then
/// the frame allocator from the memory map, per-CPU scheduler state, the
/// IRQ router, firmware tables, and finally init's process skeleton.
#[cfg(target_os = "none")]
pub fn kernel_main(info: boot::BootInfo) -> ! {
    let level = boot::cmdline_option(&info.cmdline, "loglevel")
        .and_then(logger::level_from_str)
        .unwrap_or(log::LevelFilter::Info);
    let _ = logger::init(level);

    let rsdp = info.rsdp;
    {
        let mut allocator = mm::FRAME_ALLOCATOR.lock();
        for region in &info.memory {
            allocator.add_region(*region);
        }
        log::info!(
            "mm: {} frames usable",
            allocator.free_frames()
        );
    }
    boot::install(info);

    #[cfg(target_arch = "x86_64")]
    {
        arch::pat::init();
        arch::pic::init();
        arch::apic::enable_local_apic(irq::SPURIOUS_VECTOR as u8);
        arch::entry::init_idt();
    }

    if let Err(e) = acpi::init(rsdp) {
        log::warn!("acpi: unavailable ({})", e);
    }
    sched::init(acpi::cpu_count().max(1));
    let _ = irq::init(sched::cpu_count());

    // The platform timer line drives preemption and time-keeping.
    fn timer_irq(_vector: u32, _userdata: usize) {
        timer_tick();
    }
    match irq::register_native_irq(0, timer_irq, 0) {
        Ok(_) => log::debug!("boot: timer line registered"),
        Err(e) => log::warn!("boot: no timer line ({})", e),
    }

    let init = process::create_init().expect("init process");
    log::info!(
        "boot: init pid {} ready, {} syscalls",
        init.pid,
        syscall::table_len()
    );

    loop {
        arch::wait_for_interrupt();
    }
}
