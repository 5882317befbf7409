//! Page-table tree management
//!
//! Four-level paging structures walked through the PMAP window, so a table
//! at any level is reachable from its physical address without recursive
//! mapping tricks. Interior tables are allocated zero-filled on first
//! demand and freed when the owning space is destroyed.
//!
//! Entry bit layout follows the x86_64 convention; other architectures
//! translate in their `arch` backend before installing entries.

#![allow(dead_code)]

use core::ops::{Index, IndexMut};

use super::{frame::FrameIdx, PhysAddr};

/// Number of entries in one table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Number of user-half entries in the top-level table. Slots 256..512 are
/// the canonical kernel half, aliased into every space.
pub const USER_L4_ENTRIES: usize = 256;

bitflags::bitflags! {
    /// Hardware page-table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        /// PWT: write-through when PAT index selects it.
        const WRITE_THROUGH = 1 << 3;
        /// PCD: cache-disable half of the PAT index.
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// PAT bit on leaf entries (bit 7).
        const PAT           = 1 << 7;
        const GLOBAL        = 1 << 8;
        /// Software bit: this leaf is a copy-on-write share.
        const COW           = 1 << 9;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// One page-table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    pub fn frame(self) -> Option<FrameIdx> {
        self.is_present()
            .then(|| FrameIdx::new((self.0 & Self::ADDR_MASK) >> 12))
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn set(&mut self, frame: FrameIdx, flags: EntryFlags) {
        self.0 = (frame.as_u64() << 12) & Self::ADDR_MASK | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A 512-entry table, page-sized and page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Table indices of a canonical virtual address, top level first.
pub const fn table_indices(vaddr: u64) -> [usize; 4] {
    [
        ((vaddr >> 39) & 0x1FF) as usize,
        ((vaddr >> 30) & 0x1FF) as usize,
        ((vaddr >> 21) & 0x1FF) as usize,
        ((vaddr >> 12) & 0x1FF) as usize,
    ]
}

/// Interior-table flags: interior entries stay maximally permissive; the
/// leaf entry enforces the actual protection.
pub const INTERIOR_FLAGS: EntryFlags = EntryFlags::PRESENT
    .union(EntryFlags::WRITABLE)
    .union(EntryFlags::USER);

// ---------------------------------------------------------------------------
// Hardware tree walks (bare metal only -- they dereference the PMAP window)
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod walks {
    use super::*;
    use crate::error::{KernelError, KernelResult};
    use crate::mm::{frame::FRAME_ALLOCATOR, frame_ptr, phys_to_virt};

    fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
        // SAFETY: every table frame is RAM, reachable through the PMAP
        // window; callers hold the owning space's mutex.
        unsafe { &mut *(phys_to_virt(phys).as_u64() as *mut PageTable) }
    }

    /// Install a leaf mapping, allocating interior tables on demand.
    ///
    /// Newly allocated interior tables are zero-filled before being linked.
    pub fn map_leaf(
        root: PhysAddr,
        vaddr: u64,
        frame: FrameIdx,
        flags: EntryFlags,
    ) -> KernelResult<()> {
        let idx = table_indices(vaddr);
        let mut table = table_mut(root);
        for level in 0..3 {
            let entry = &mut table[idx[level]];
            let next_phys = match entry.frame() {
                Some(f) => PhysAddr::new(f.phys_addr()),
                None => {
                    let f = FRAME_ALLOCATOR.lock().alloc_page()?;
                    // SAFETY: fresh exclusive frame, PMAP-mapped.
                    unsafe {
                        core::ptr::write_bytes(frame_ptr(f), 0, crate::mm::PAGE_SIZE);
                    }
                    entry.set(f, INTERIOR_FLAGS);
                    PhysAddr::new(f.phys_addr())
                }
            };
            table = table_mut(next_phys);
        }
        let leaf = &mut table[idx[3]];
        if leaf.is_present() {
            return Err(KernelError::AlreadyExists);
        }
        leaf.set(frame, flags);
        Ok(())
    }

    /// Remove a leaf mapping, returning the frame it pointed at.
    pub fn unmap_leaf(root: PhysAddr, vaddr: u64) -> Option<FrameIdx> {
        let idx = table_indices(vaddr);
        let mut table = table_mut(root);
        for level in 0..3 {
            let entry = table[idx[level]];
            table = table_mut(PhysAddr::new(entry.frame()?.phys_addr()));
        }
        let leaf = &mut table[idx[3]];
        let frame = leaf.frame()?;
        leaf.clear();
        Some(frame)
    }

    /// Rewrite the flags of a present leaf entry.
    pub fn protect_leaf(root: PhysAddr, vaddr: u64, flags: EntryFlags) -> KernelResult<()> {
        let idx = table_indices(vaddr);
        let mut table = table_mut(root);
        for level in 0..3 {
            let entry = table[idx[level]];
            let f = entry.frame().ok_or(KernelError::BadAddress {
                addr: vaddr as usize,
            })?;
            table = table_mut(PhysAddr::new(f.phys_addr()));
        }
        let leaf = &mut table[idx[3]];
        let frame = leaf.frame().ok_or(KernelError::BadAddress {
            addr: vaddr as usize,
        })?;
        leaf.set(frame, flags);
        Ok(())
    }

    /// Free the user-half interior tables but keep the root, clearing its
    /// user slots. Used on exec to reuse the root for the fresh image.
    pub fn free_user_subtrees(root: PhysAddr) {
        let root_table = table_mut(root);
        for l4 in 0..USER_L4_ENTRIES {
            let Some(l3_frame) = root_table[l4].frame() else {
                continue;
            };
            let l3_table = table_mut(PhysAddr::new(l3_frame.phys_addr()));
            for l3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_frame) = l3_table[l3].frame() else {
                    continue;
                };
                let l2_table = table_mut(PhysAddr::new(l2_frame.phys_addr()));
                for l2 in 0..PAGE_TABLE_ENTRIES {
                    if let Some(l1_frame) = l2_table[l2].frame() {
                        FRAME_ALLOCATOR.lock().free_pt(l1_frame);
                    }
                }
                FRAME_ALLOCATOR.lock().free_pt(l2_frame);
            }
            FRAME_ALLOCATOR.lock().free_pt(l3_frame);
            root_table[l4].clear();
        }
    }

    /// Free every user-half interior table of the tree, then the root.
    ///
    /// Leaf frames are the caller's responsibility (the space tracks them
    /// with refcounts); only table frames are released here, via `free_pt`
    /// so bootloader-provided frames are tolerated.
    pub fn free_user_tree(root: PhysAddr) {
        let root_table = table_mut(root);
        for l4 in 0..USER_L4_ENTRIES {
            let Some(l3_frame) = root_table[l4].frame() else {
                continue;
            };
            let l3_table = table_mut(PhysAddr::new(l3_frame.phys_addr()));
            for l3 in 0..PAGE_TABLE_ENTRIES {
                let Some(l2_frame) = l3_table[l3].frame() else {
                    continue;
                };
                let l2_table = table_mut(PhysAddr::new(l2_frame.phys_addr()));
                for l2 in 0..PAGE_TABLE_ENTRIES {
                    if let Some(l1_frame) = l2_table[l2].frame() {
                        FRAME_ALLOCATOR.lock().free_pt(l1_frame);
                    }
                }
                FRAME_ALLOCATOR.lock().free_pt(l2_frame);
            }
            FRAME_ALLOCATOR.lock().free_pt(l3_frame);
            root_table[l4].clear();
        }
        FRAME_ALLOCATOR.lock().free_pt(root.frame());
    }
}

#[cfg(target_os = "none")]
pub use walks::{free_user_subtrees, free_user_tree, map_leaf, protect_leaf, unmap_leaf};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_frame_and_flags() {
        let mut e = PageTableEntry::empty();
        assert!(!e.is_present());
        e.set(
            FrameIdx::new(0x1234),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        );
        assert!(e.is_present());
        assert_eq!(e.frame(), Some(FrameIdx::new(0x1234)));
        assert!(e.flags().contains(EntryFlags::WRITABLE));
        e.clear();
        assert_eq!(e.frame(), None);
    }

    #[test]
    fn nx_bit_survives_round_trip() {
        let mut e = PageTableEntry::empty();
        e.set(
            FrameIdx::new(1),
            EntryFlags::PRESENT | EntryFlags::NO_EXECUTE,
        );
        assert!(e.flags().contains(EntryFlags::NO_EXECUTE));
        assert_eq!(e.frame(), Some(FrameIdx::new(1)));
    }

    #[test]
    fn indices_decompose_canonical_address() {
        // 0x0000_7FFF_FFFF_F000: last user page.
        let idx = table_indices(0x0000_7FFF_FFFF_F000);
        assert_eq!(idx, [255, 511, 511, 511]);
        let idx = table_indices(0);
        assert_eq!(idx, [0, 0, 0, 0]);
    }

    #[test]
    fn cow_is_a_software_bit() {
        let mut e = PageTableEntry::empty();
        e.set(FrameIdx::new(7), EntryFlags::PRESENT | EntryFlags::COW);
        assert!(e.flags().contains(EntryFlags::COW));
        // COW never implies writable.
        assert!(!e.flags().contains(EntryFlags::WRITABLE));
    }
}
