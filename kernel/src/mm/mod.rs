//! Memory management
//!
//! Layered leaves-first: [`frame`] owns all RAM frames and hands out
//! reference-counted descriptors; [`space`] manages per-process address
//! spaces (zones + page tables); [`fault`] resolves page faults against a
//! space; [`user`] moves bytes across the user/kernel boundary.

use core::sync::atomic::{AtomicU64, Ordering};

pub mod fault;
pub mod frame;
pub mod page_table;
pub mod space;
pub mod user;

pub use fault::{handle_page_fault, PageFaultInfo, PageFaultReason};
pub use frame::{FrameIdx, FRAME_ALLOCATOR};
pub use space::{Access, AddressSpace, MapFlags, Prot, Zone};

/// Size of a page / physical frame.
pub const PAGE_SIZE: usize = 4096;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn frame(self) -> FrameIdx {
        FrameIdx::new(self.0 / PAGE_SIZE as u64)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u64 - 1)) as usize
    }
}

/// Base of the kernel's identity mapping of all physical RAM ("PMAP").
///
/// Set once from the bootloader handoff. Page-table walks and frame copies
/// go through this window so they never need recursive mapping tricks.
pub static PHYS_MAP_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Translate a physical address into the PMAP window.
pub fn phys_to_virt(addr: PhysAddr) -> VirtAddr {
    VirtAddr(PHYS_MAP_OFFSET.load(Ordering::Acquire) + addr.0)
}

/// Kernel-visible pointer to the start of a frame via the PMAP window.
pub fn frame_ptr(frame: FrameIdx) -> *mut u8 {
    phys_to_virt(PhysAddr(frame.as_u64() * PAGE_SIZE as u64)).as_u64() as *mut u8
}

/// Round `len` up to whole pages.
pub const fn page_round_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_page_math() {
        let va = VirtAddr::new(0x1234_5678);
        assert_eq!(va.page_base().as_u64(), 0x1234_5000);
        assert_eq!(va.page_offset(), 0x678);
        assert!(!va.is_page_aligned());
        assert!(va.page_base().is_page_aligned());
    }

    #[test]
    fn round_up_to_pages() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn phys_addr_to_frame() {
        assert_eq!(PhysAddr::new(0x5000).frame().as_u64(), 5);
        assert_eq!(PhysAddr::new(0x5FFF).frame().as_u64(), 5);
    }
}
