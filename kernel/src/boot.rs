//! Bootloader handoff
//!
//! The kernel expects a tagged information block at entry: a memory map,
//! optionally the RSDP address, a framebuffer descriptor, and a command
//! line. On x86_64 the `bootloader_api` info structure carries those
//! tags; FDT platforms hand over a flattened-device-tree pointer
//! instead. Everything the rest of the kernel needs is normalized into
//! [`BootInfo`] here.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{string::String, vec::Vec};

use crate::mm::frame::MemRegion;
use crate::sync::once_lock::OnceLock;

/// Framebuffer description from the boot tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramebufferInfo {
    pub address: u64,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub bytes_per_pixel: usize,
}

/// Normalized boot information.
#[derive(Default)]
pub struct BootInfo {
    /// Usable RAM regions.
    pub memory: Vec<MemRegion>,
    /// Physical address of the ACPI RSDP, when the loader announced it.
    pub rsdp: Option<u64>,
    pub framebuffer: Option<FramebufferInfo>,
    /// Kernel command line.
    pub cmdline: String,
    /// Flattened device tree (FDT platforms).
    pub fdt: Option<u64>,
    /// Offset of the physical memory mapping.
    pub phys_map_offset: u64,
}

static BOOT_INFO: OnceLock<BootInfo> = OnceLock::new();

/// Record the normalized handoff. Called exactly once, before any
/// subsystem init.
pub fn install(info: BootInfo) {
    crate::mm::PHYS_MAP_OFFSET.store(info.phys_map_offset, core::sync::atomic::Ordering::Release);
    let _ = BOOT_INFO.set(info);
}

/// The recorded handoff.
pub fn info() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

/// Parse a `key=value` option out of the command line.
pub fn cmdline_option<'a>(cmdline: &'a str, key: &str) -> Option<&'a str> {
    cmdline.split_whitespace().find_map(|word| {
        let (k, v) = word.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Size of the kernel heap carved out of the first large usable region.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub const HEAP_LEN: usize = 16 * 1024 * 1024;

/// Pick the physical range for the kernel heap. Runs before any
/// allocation is possible, so it only walks the raw region list.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn carve_heap(raw: &bootloader_api::BootInfo) -> Option<(u64, usize)> {
    use bootloader_api::info::MemoryRegionKind;
    for region in raw.memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        let start = region.start.div_ceil(crate::mm::PAGE_SIZE as u64) * crate::mm::PAGE_SIZE as u64;
        if region.end >= start && (region.end - start) as usize >= HEAP_LEN {
            return Some((start, HEAP_LEN));
        }
    }
    None
}

/// Convert a `bootloader_api` handoff into the normalized form. The heap
/// carve (already claimed by the allocator) is excluded from the frame
/// regions.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn from_bootloader(
    raw: &'static mut bootloader_api::BootInfo,
    heap: Option<(u64, usize)>,
) -> BootInfo {
    use bootloader_api::info::MemoryRegionKind;

    let (heap_start, heap_end) = heap
        .map(|(base, len)| (base, base + len as u64))
        .unwrap_or((0, 0));
    let mut memory = Vec::new();
    for region in raw.memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        let mut push = |lo: u64, hi: u64| {
            let start_frame = lo.div_ceil(crate::mm::PAGE_SIZE as u64);
            let end_frame = hi / crate::mm::PAGE_SIZE as u64;
            if end_frame > start_frame {
                memory.push(MemRegion {
                    start: crate::mm::FrameIdx::new(start_frame),
                    count: (end_frame - start_frame) as usize,
                });
            }
        };
        if heap_end > heap_start && region.start < heap_end && heap_start < region.end {
            // Split around the heap carve.
            push(region.start, heap_start);
            push(heap_end, region.end);
        } else {
            push(region.start, region.end);
        }
    }

    let framebuffer = raw.framebuffer.as_ref().into_option().map(|fb| {
        let info = fb.info();
        FramebufferInfo {
            address: fb.buffer().as_ptr() as u64,
            width: info.width,
            height: info.height,
            stride: info.stride,
            bytes_per_pixel: info.bytes_per_pixel,
        }
    });

    BootInfo {
        memory,
        rsdp: raw.rsdp_addr.into_option(),
        framebuffer,
        cmdline: String::new(),
        fdt: None,
        phys_map_offset: raw.physical_memory_offset.into_option().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_options() {
        let cl = "console=ttyS0 loglevel=debug quiet";
        assert_eq!(cmdline_option(cl, "loglevel"), Some("debug"));
        assert_eq!(cmdline_option(cl, "console"), Some("ttyS0"));
        assert_eq!(cmdline_option(cl, "root"), None);
        // Bare words are not options.
        assert_eq!(cmdline_option(cl, "quiet"), None);
    }
}
