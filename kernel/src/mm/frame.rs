//! Physical frame allocator
//!
//! Owns every RAM frame described by the bootloader memory map and hands
//! out reference-counted descriptors. A frame whose refcount drops to zero
//! goes back on the free list immediately; reclamation is never delayed.
//!
//! The free list is intrusive in spirit: linkage is an index-based arena
//! (`next_free[i]` chains free slots), so membership is a property of the
//! frame itself and removal is O(1).

#![allow(clippy::new_without_default)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Physical frame number (physical address / page size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameIdx(u64);

impl FrameIdx {
    pub const fn new(idx: u64) -> Self {
        Self(idx)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn phys_addr(self) -> u64 {
        self.0 * super::PAGE_SIZE as u64
    }
}

/// Sentinel for "no next frame" in the free-list arena.
const FREE_LIST_END: u32 = u32::MAX;

/// One contiguous usable RAM region from the bootloader memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    /// First frame of the region.
    pub start: FrameIdx,
    /// Number of frames.
    pub count: usize,
}

/// Per-region frame bookkeeping: refcounts plus free-list linkage.
#[cfg(feature = "alloc")]
struct RegionFrames {
    start: u64,
    /// Refcount per frame; 0 means the frame is on the free list.
    refcounts: Vec<u32>,
    /// Free-list successor per frame (index within the region).
    next_free: Vec<u32>,
}

#[cfg(feature = "alloc")]
impl RegionFrames {
    fn contains(&self, frame: FrameIdx) -> bool {
        let idx = frame.as_u64();
        idx >= self.start && idx < self.start + self.refcounts.len() as u64
    }

    fn slot(&self, frame: FrameIdx) -> usize {
        (frame.as_u64() - self.start) as usize
    }
}

/// The physical frame allocator.
///
/// Invariant: a frame with refcount zero is on exactly one free list; a
/// frame with refcount ≥ 1 is owned by at least one address space or
/// kernel allocation.
#[cfg(feature = "alloc")]
pub struct FrameAllocator {
    regions: Vec<RegionFrames>,
    /// Head of the free list as (region index, slot), or `None` when empty.
    free_head: Option<(usize, u32)>,
    /// Continuation heads for chains that cross region boundaries; popped
    /// when an in-region chain runs out.
    cross_links: Vec<(usize, u32)>,
    free_count: u64,
    total_count: u64,
}

#[cfg(feature = "alloc")]
impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
            free_head: None,
            cross_links: Vec::new(),
            free_count: 0,
            total_count: 0,
        }
    }

    /// Seed the allocator with a usable region from the memory map.
    ///
    /// All frames start free. Regions must not overlap; the bootloader map
    /// guarantees this.
    pub fn add_region(&mut self, region: MemRegion) {
        if region.count == 0 {
            return;
        }
        let region_idx = self.regions.len();
        // Chain slot i -> i + 1; the tail ends the in-region chain.
        let mut next_free: Vec<u32> = (1..region.count as u32).collect();
        next_free.push(FREE_LIST_END);
        let mut refcounts = Vec::new();
        refcounts.resize(region.count, 0);
        self.regions.push(RegionFrames {
            start: region.start.as_u64(),
            refcounts,
            next_free,
        });
        // The new region becomes the head; a previous head continues after
        // this region's chain drains.
        if let Some(prev_head) = self.free_head.take() {
            self.cross_links.push(prev_head);
        }
        self.free_head = Some((region_idx, 0));
        self.free_count += region.count as u64;
        self.total_count += region.count as u64;
    }

    /// Allocate one frame with refcount 1.
    pub fn alloc_page(&mut self) -> KernelResult<FrameIdx> {
        let (region_idx, slot) = match self.free_head {
            Some(head) => head,
            None => return Err(KernelError::OutOfMemory),
        };
        let region = &mut self.regions[region_idx];
        debug_assert_eq!(region.refcounts[slot as usize], 0);
        region.refcounts[slot as usize] = 1;
        let next = region.next_free[slot as usize];
        region.next_free[slot as usize] = FREE_LIST_END;
        self.free_head = if next != FREE_LIST_END {
            Some((region_idx, next))
        } else {
            self.cross_links.pop()
        };
        self.free_count -= 1;
        Ok(FrameIdx::new(region.start + slot as u64))
    }

    /// Increment the refcount of a live frame.
    pub fn ref_page(&mut self, frame: FrameIdx) -> KernelResult<()> {
        let (region_idx, slot) = self.lookup(frame).ok_or(KernelError::Invalid)?;
        let rc = &mut self.regions[region_idx].refcounts[slot];
        if *rc == 0 {
            return Err(KernelError::Invalid);
        }
        *rc += 1;
        Ok(())
    }

    /// Drop one reference; at zero the frame returns to the free list.
    pub fn free_page(&mut self, frame: FrameIdx) {
        let Some((region_idx, slot)) = self.lookup(frame) else {
            panic!("free_page: frame {:#x} not allocator-owned", frame.as_u64());
        };
        let region = &mut self.regions[region_idx];
        let rc = &mut region.refcounts[slot];
        if *rc == 0 {
            panic!("free_page: double free of frame {:#x}", frame.as_u64());
        }
        *rc -= 1;
        if *rc == 0 {
            self.push_free(region_idx, slot as u32);
        }
    }

    /// Drop one reference held by a page-table entry.
    ///
    /// Unlike [`free_page`](Self::free_page) this is legal against frames
    /// the allocator never handed out (bootloader-placed kernel image
    /// frames); those are a no-op.
    pub fn free_pt(&mut self, frame: FrameIdx) {
        if let Some((region_idx, slot)) = self.lookup(frame) {
            if self.regions[region_idx].refcounts[slot] > 0 {
                self.free_page(frame);
            }
        }
    }

    /// Current refcount of a frame the allocator manages.
    pub fn get_page(&self, frame: FrameIdx) -> Option<u32> {
        let (region_idx, slot) = self.lookup(frame)?;
        let rc = self.regions[region_idx].refcounts[slot];
        (rc > 0).then_some(rc)
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> u64 {
        self.free_count
    }

    /// Total frames under management.
    pub fn total_frames(&self) -> u64 {
        self.total_count
    }

    fn lookup(&self, frame: FrameIdx) -> Option<(usize, usize)> {
        self.regions
            .iter()
            .position(|r| r.contains(frame))
            .map(|i| (i, self.regions[i].slot(frame)))
    }

    fn push_free(&mut self, region_idx: usize, slot: u32) {
        match self.free_head {
            Some((head_region, head_slot)) if head_region == region_idx => {
                self.regions[region_idx].next_free[slot as usize] = head_slot;
            }
            Some(prev) => {
                self.regions[region_idx].next_free[slot as usize] = FREE_LIST_END;
                self.cross_links.push(prev);
            }
            None => {
                self.regions[region_idx].next_free[slot as usize] = FREE_LIST_END;
            }
        }
        self.free_head = Some((region_idx, slot));
        self.free_count += 1;
    }
}

/// Global frame allocator, guarded by a spin mutex.
#[cfg(feature = "alloc")]
pub static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Allocate one frame and zero it through the PMAP window.
///
/// Only meaningful on bare metal where the PMAP exists; unit tests use the
/// allocator's bookkeeping API directly.
#[cfg(all(feature = "alloc", target_os = "none"))]
pub fn alloc_zeroed_page() -> KernelResult<FrameIdx> {
    let frame = FRAME_ALLOCATOR.lock().alloc_page()?;
    // SAFETY: the frame was just handed out exclusively and the PMAP maps
    // all of RAM writable for the kernel.
    unsafe {
        core::ptr::write_bytes(super::frame_ptr(frame), 0, super::PAGE_SIZE);
    }
    Ok(frame)
}

#[cfg(all(feature = "alloc", not(target_os = "none")))]
pub fn alloc_zeroed_page() -> KernelResult<FrameIdx> {
    FRAME_ALLOCATOR.lock().alloc_page()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with(frames: usize) -> FrameAllocator {
        let mut a = FrameAllocator::new();
        a.add_region(MemRegion {
            start: FrameIdx::new(0x100),
            count: frames,
        });
        a
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut a = allocator_with(8);
        assert_eq!(a.free_frames(), 8);
        let f = a.alloc_page().unwrap();
        assert_eq!(a.free_frames(), 7);
        assert_eq!(a.get_page(f), Some(1));
        a.free_page(f);
        assert_eq!(a.free_frames(), 8);
        assert_eq!(a.get_page(f), None);
    }

    #[test]
    fn refcount_keeps_frame_live() {
        let mut a = allocator_with(4);
        let f = a.alloc_page().unwrap();
        a.ref_page(f).unwrap();
        assert_eq!(a.get_page(f), Some(2));
        a.free_page(f);
        // Still referenced once; not yet free.
        assert_eq!(a.get_page(f), Some(1));
        assert_eq!(a.free_frames(), 3);
        a.free_page(f);
        assert_eq!(a.free_frames(), 4);
    }

    #[test]
    fn exhaustion_reports_oom() {
        let mut a = allocator_with(2);
        let _f1 = a.alloc_page().unwrap();
        let _f2 = a.alloc_page().unwrap();
        assert_eq!(a.alloc_page(), Err(KernelError::OutOfMemory));
    }

    #[test]
    fn free_pt_is_noop_on_foreign_frames() {
        let mut a = allocator_with(2);
        // Kernel image frame outside any region.
        a.free_pt(FrameIdx::new(0x9999));
        assert_eq!(a.free_frames(), 2);
        // And behaves like free_page on owned frames.
        let f = a.alloc_page().unwrap();
        a.free_pt(f);
        assert_eq!(a.free_frames(), 2);
    }

    #[test]
    fn ref_page_rejects_free_frame() {
        let mut a = allocator_with(2);
        let f = a.alloc_page().unwrap();
        a.free_page(f);
        assert_eq!(a.ref_page(f), Err(KernelError::Invalid));
    }

    #[test]
    fn multiple_regions_drain_completely() {
        let mut a = FrameAllocator::new();
        a.add_region(MemRegion {
            start: FrameIdx::new(0x10),
            count: 3,
        });
        a.add_region(MemRegion {
            start: FrameIdx::new(0x100),
            count: 2,
        });
        assert_eq!(a.free_frames(), 5);
        let mut got = alloc::vec::Vec::new();
        while let Ok(f) = a.alloc_page() {
            got.push(f);
        }
        assert_eq!(got.len(), 5);
        assert_eq!(a.free_frames(), 0);
        for f in got {
            a.free_page(f);
        }
        assert_eq!(a.free_frames(), 5);
    }
}
