//! Kernel executable entry points

#![no_std]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64_entry {
    use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};

    /// Ask the loader for a full physical-memory mapping (the PMAP).
    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_entry, config = &BOOTLOADER_CONFIG);

    fn kernel_entry(raw: &'static mut BootInfo) -> ! {
        // The PMAP offset and kernel heap must exist before the first
        // allocation; everything after is free to use Vec/Box.
        let phys_offset = raw.physical_memory_offset.into_option().unwrap_or(0);
        vermilion_kernel::mm::PHYS_MAP_OFFSET
            .store(phys_offset, core::sync::atomic::Ordering::Release);
        let heap = vermilion_kernel::boot::carve_heap(raw);
        if let Some((phys, len)) = heap {
            // SAFETY: the carve is usable RAM, excluded from the frame
            // allocator, reached through the PMAP window.
            unsafe {
                vermilion_kernel::init_heap(phys_offset + phys, len);
            }
        }
        let info = vermilion_kernel::boot::from_bootloader(raw, heap);
        vermilion_kernel::kernel_main(info)
    }
}

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
mod fdt_entry {
    /// FDT platforms receive the device-tree pointer from firmware; the
    /// per-platform assembly start stub lands here.
    #[no_mangle]
    pub extern "C" fn kernel_entry(fdt_ptr: u64) -> ! {
        let info = vermilion_kernel::boot::BootInfo {
            fdt: Some(fdt_ptr),
            ..Default::default()
        };
        vermilion_kernel::kernel_main(info)
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    vermilion_kernel::kprintln!("kernel panic: {}", info);
    loop {
        vermilion_kernel::arch::disable_interrupts();
        vermilion_kernel::arch::wait_for_interrupt();
    }
}

/// Host builds only exist so `cargo check`/`cargo test` cover the crate;
/// the kernel proper never runs here.
#[cfg(not(target_os = "none"))]
fn main() {
    std::println!("vermilion-kernel: bare-metal image, nothing to run on the host");
}
