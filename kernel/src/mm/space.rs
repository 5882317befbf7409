//! Virtual address-space engine
//!
//! An [`AddressSpace`] is a sorted set of non-overlapping [`Zone`]s plus an
//! architecture page-table root. The zone tree and all page-table mutations
//! are guarded by the space's mutex; only one thread mutates a given space
//! at a time.
//!
//! Copy-on-write: `fork` shares present frames by bumping their refcount
//! and downgrading both sides to read-only; the first write faults and
//! duplicates the frame. Writes after fork never alias.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{
    frame::{FrameIdx, FRAME_ALLOCATOR},
    page_table::EntryFlags,
    page_round_up, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Lowest mappable user address (page zero is never mapped).
pub const USER_BASE: u64 = 0x1000;
/// One past the highest mappable user address.
pub const USER_TOP: u64 = 0x0000_7FFF_FFFF_F000;
/// Search origin for non-FIXED placements.
pub const MMAP_BASE: u64 = 0x0000_2000_0000_0000;
/// Default heap origin.
pub const HEAP_BASE: u64 = 0x0000_1000_0000_0000;
/// Top of the initial user stack.
pub const STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;

bitflags::bitflags! {
    /// Zone protection set.
    ///
    /// `WRITE` and `EXEC` are mutually exclusive; the three cache modes are
    /// mutually exclusive with each other (absent all three, write-through
    /// is the default).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const EXEC          = 1 << 2;
        /// Strong-uncacheable.
        const UNCACHED      = 1 << 3;
        /// Write-combining.
        const WRITE_COMBINE = 1 << 4;
        /// Write-back.
        const WRITE_BACK    = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Zone mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Reserved; currently rejected.
        const SHARED    = 1 << 0;
        const PRIVATE   = 1 << 1;
        /// Place exactly at the hint.
        const FIXED     = 1 << 2;
        /// With FIXED: fail instead of unmapping an overlap.
        const EXCL      = 1 << 3;
        /// Zero-fill, no backing file.
        const ANONYMOUS = 1 << 4;
    }
}

/// Backing store a zone can read pages from.
///
/// Implemented by the file layer; the seam keeps the address-space engine
/// independent of file-table internals. The zone's reference is the only
/// strong edge, and files never point back at spaces.
pub trait VmFile: Send + Sync {
    /// Read up to a page at `offset`; short reads zero-fill the remainder.
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;
}

/// File backing of a zone.
#[derive(Clone)]
pub struct ZoneFile {
    pub file: Arc<dyn VmFile>,
    pub offset: u64,
}

/// A half-open virtual-address range with uniform protection and backing.
#[derive(Clone)]
pub struct Zone {
    base: u64,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    file: Option<ZoneFile>,
}

impl Zone {
    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    pub fn prot(&self) -> Prot {
        self.prot
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// File offset backing `addr`, if this zone is file-backed.
    fn file_offset_of(&self, addr: u64) -> Option<(Arc<dyn VmFile>, u64)> {
        let zf = self.file.as_ref()?;
        Some((zf.file.clone(), zf.offset + (addr - self.base)))
    }
}

/// One present leaf page.
#[derive(Debug, Clone, Copy)]
struct PageSlot {
    frame: FrameIdx,
    /// Copy-on-write share: hardware entry is read-only regardless of the
    /// zone protection until the first write duplicates the frame.
    cow: bool,
}

struct SpaceInner {
    /// Zones keyed by base address; invariant: never overlapping.
    zones: BTreeMap<u64, Zone>,
    /// Present leaf pages keyed by page-aligned virtual address.
    pages: BTreeMap<u64, PageSlot>,
    /// Heap high-water mark.
    brk: u64,
}

/// A user address space.
pub struct AddressSpace {
    /// Physical address of the top-level page table (0 when no hardware
    /// tree exists, e.g. in host unit tests).
    root: AtomicU64,
    /// Bitmask of CPUs currently running a thread in this space; the TLB
    /// shootdown set.
    active_cpus: AtomicU64,
    inner: Mutex<SpaceInner>,
}

/// Access kind requested by a faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

/// Batched TLB invalidation.
///
/// Collects up to `MAX_BATCH` addresses; overflowing the batch degrades to
/// a full flush on commit, which is cheaper than many single invalidations.
pub struct TlbFlushBatch {
    addresses: [u64; Self::MAX_BATCH],
    count: usize,
}

impl Default for TlbFlushBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TlbFlushBatch {
    const MAX_BATCH: usize = 16;

    pub const fn new() -> Self {
        Self {
            addresses: [0; Self::MAX_BATCH],
            count: 0,
        }
    }

    #[inline]
    pub fn add(&mut self, vaddr: u64) {
        if self.count < Self::MAX_BATCH {
            self.addresses[self.count] = vaddr;
        }
        self.count += 1; // Past MAX_BATCH the commit falls back to a full flush.
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Invalidate on the local CPU and interrupt every other CPU running
    /// the space. Must happen before the syscall returns to user mode.
    fn commit(self, space: &AddressSpace) {
        if self.count == 0 {
            return;
        }
        #[cfg(target_os = "none")]
        {
            if self.count > Self::MAX_BATCH {
                crate::arch::tlb_flush_all();
            } else {
                for addr in &self.addresses[..self.count] {
                    crate::arch::tlb_flush_address(*addr);
                }
            }
            crate::irq::tlb_shootdown(space.active_cpus.load(Ordering::SeqCst));
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = space;
        }
    }
}

impl AddressSpace {
    /// Create a fresh space sharing all kernel mappings.
    ///
    /// User slots start empty; the kernel half of the root table aliases
    /// the canonical kernel tree.
    pub fn new() -> KernelResult<Self> {
        #[cfg(target_os = "none")]
        let root = crate::arch::vm::new_user_root()?;
        #[cfg(not(target_os = "none"))]
        let root = 0u64;
        Ok(Self {
            root: AtomicU64::new(root),
            active_cpus: AtomicU64::new(0),
            inner: Mutex::new(SpaceInner {
                zones: BTreeMap::new(),
                pages: BTreeMap::new(),
                brk: HEAP_BASE,
            }),
        })
    }

    /// Physical address of the top-level table, for the context switcher.
    pub fn root(&self) -> u64 {
        self.root.load(Ordering::Acquire)
    }

    /// Mark this space as running on `cpu` (called at context switch).
    pub fn activate_on(&self, cpu: usize) {
        self.active_cpus.fetch_or(1 << cpu, Ordering::SeqCst);
    }

    /// Mark this space as no longer running on `cpu`.
    pub fn deactivate_on(&self, cpu: usize) {
        self.active_cpus.fetch_and(!(1 << cpu), Ordering::SeqCst);
    }

    /// Validate a protection mask: `W∧X` forbidden, cache modes mutually
    /// exclusive.
    pub fn validate_prot(prot: Prot) -> KernelResult<()> {
        if prot.contains(Prot::WRITE | Prot::EXEC) {
            return Err(KernelError::Invalid);
        }
        let cache_bits = (prot & (Prot::UNCACHED | Prot::WRITE_COMBINE | Prot::WRITE_BACK))
            .bits()
            .count_ones();
        if cache_bits > 1 {
            return Err(KernelError::Invalid);
        }
        Ok(())
    }

    /// Map a new zone.
    ///
    /// `FIXED` places exactly at `hint` (with `EXCL`, any overlapping byte
    /// fails with EINVAL; without it, the overlap is unmapped first).
    /// Without `FIXED` the hint is advisory. `SHARED` is reserved and
    /// rejected; exactly one of `SHARED | PRIVATE` must be given.
    pub fn map(
        &self,
        hint: u64,
        offset: u64,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        file: Option<Arc<dyn VmFile>>,
    ) -> KernelResult<u64> {
        if len == 0 {
            return Err(KernelError::Invalid);
        }
        let sharing = flags & (MapFlags::SHARED | MapFlags::PRIVATE);
        if sharing.bits().count_ones() != 1 {
            return Err(KernelError::Invalid);
        }
        if flags.contains(MapFlags::SHARED) {
            // Reserved sharing mode.
            return Err(KernelError::Invalid);
        }
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::Invalid);
        }
        if flags.contains(MapFlags::ANONYMOUS) != file.is_none() {
            return Err(KernelError::Invalid);
        }
        Self::validate_prot(prot)?;
        let len = page_round_up(len);

        let mut inner = self.inner.lock();
        let base = if flags.contains(MapFlags::FIXED) {
            if hint % PAGE_SIZE as u64 != 0 || hint < USER_BASE || hint + len as u64 > USER_TOP {
                return Err(KernelError::Invalid);
            }
            if Self::overlaps(&inner.zones, hint, len) {
                if flags.contains(MapFlags::EXCL) {
                    return Err(KernelError::Invalid);
                }
                self.unmap_locked(&mut inner, hint, len)?;
            }
            hint
        } else {
            let preferred = hint & !(PAGE_SIZE as u64 - 1);
            Self::find_free(&inner.zones, preferred, len).ok_or(KernelError::OutOfMemory)?
        };

        inner.zones.insert(
            base,
            Zone {
                base,
                len,
                prot,
                flags,
                file: file.map(|file| ZoneFile { file, offset }),
            },
        );
        Ok(base)
    }

    /// Unmap an arbitrary byte range, splitting zones at the endpoints.
    pub fn unmap(&self, addr: u64, len: usize) -> KernelResult<()> {
        if addr % PAGE_SIZE as u64 != 0 || len == 0 {
            return Err(KernelError::Invalid);
        }
        let len = page_round_up(len);
        let mut inner = self.inner.lock();
        self.unmap_locked(&mut inner, addr, len)
    }

    /// Change protection on a range. Every page of the range must be
    /// mapped; zones are split at the endpoints.
    pub fn protect(&self, addr: u64, len: usize, prot: Prot) -> KernelResult<()> {
        if addr % PAGE_SIZE as u64 != 0 || len == 0 {
            return Err(KernelError::Invalid);
        }
        Self::validate_prot(prot)?;
        let len = page_round_up(len);
        let end = addr + len as u64;

        let mut inner = self.inner.lock();
        // The whole range must be covered by zones.
        let mut cursor = addr;
        for zone in inner.zones.values() {
            if zone.end() <= cursor {
                continue;
            }
            if zone.base > cursor {
                break;
            }
            cursor = zone.end();
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            return Err(KernelError::OutOfMemory);
        }

        Self::split_at(&mut inner.zones, addr);
        Self::split_at(&mut inner.zones, end);
        for (_, zone) in inner.zones.range_mut(addr..end) {
            zone.prot = prot;
        }

        // Rewrite present leaves and invalidate.
        let mut batch = TlbFlushBatch::new();
        #[cfg(target_os = "none")]
        let root = self.root();
        let pages: alloc::vec::Vec<u64> = inner.pages.range(addr..end).map(|(va, _)| *va).collect();
        for va in pages {
            let slot = inner.pages[&va];
            let _flags = entry_flags_for(prot, slot.cow);
            #[cfg(target_os = "none")]
            super::page_table::protect_leaf(super::PhysAddr::new(root), va, _flags)?;
            batch.add(va);
        }
        batch.commit(self);
        Ok(())
    }

    /// Resolve a page for `addr`, faulting it in if absent.
    ///
    /// Called by the fault handler. On a write to a copy-on-write share,
    /// duplicates the frame, drops the source reference, and reinstalls a
    /// writable entry.
    pub fn populate_page(&self, addr: u64, access: Access) -> KernelResult<FrameIdx> {
        let page = addr & !(PAGE_SIZE as u64 - 1);
        let mut inner = self.inner.lock();

        let zone = Self::zone_containing(&inner.zones, addr)
            .ok_or(KernelError::BadAddress {
                addr: addr as usize,
            })?
            .clone();
        let allowed = match access {
            Access::Read => zone.prot.contains(Prot::READ),
            Access::Write => zone.prot.contains(Prot::WRITE),
            Access::Exec => zone.prot.contains(Prot::EXEC),
        };
        if !allowed {
            return Err(KernelError::BadAddress {
                addr: addr as usize,
            });
        }

        if let Some(slot) = inner.pages.get(&page).copied() {
            if slot.cow && access == Access::Write {
                let new_frame = self.duplicate_frame(slot.frame)?;
                FRAME_ALLOCATOR.lock().free_page(slot.frame);
                inner.pages.insert(
                    page,
                    PageSlot {
                        frame: new_frame,
                        cow: false,
                    },
                );
                self.install_leaf(page, new_frame, zone.prot, false)?;
                let mut batch = TlbFlushBatch::new();
                batch.add(page);
                batch.commit(self);
                return Ok(new_frame);
            }
            return Ok(slot.frame);
        }

        // Absent leaf: fetch by the zone's policy.
        let frame = if let Some((file, offset)) = zone.file_offset_of(page) {
            let frame = super::frame::alloc_zeroed_page()?;
            #[cfg(target_os = "none")]
            {
                // SAFETY: fresh exclusive frame reached through the PMAP.
                let buf = unsafe {
                    core::slice::from_raw_parts_mut(super::frame_ptr(frame), PAGE_SIZE)
                };
                file.read_page(offset, buf)?;
            }
            #[cfg(not(target_os = "none"))]
            {
                let mut buf = [0u8; PAGE_SIZE];
                file.read_page(offset, &mut buf)?;
            }
            frame
        } else {
            // Anonymous zero-fill.
            super::frame::alloc_zeroed_page()?
        };
        inner.pages.insert(page, PageSlot { frame, cow: false });
        self.install_leaf(page, frame, zone.prot, false)?;
        Ok(frame)
    }

    /// Copy this space for fork.
    ///
    /// Zones are cloned; every present frame is shared by bumping its
    /// refcount, with both sides downgraded to read-only copy-on-write.
    /// Kernel mappings are aliased by the fresh root, never copied.
    pub fn fork(&self) -> KernelResult<AddressSpace> {
        let child = AddressSpace::new()?;
        let mut parent_inner = self.inner.lock();
        let mut child_inner = child.inner.lock();

        child_inner.zones = parent_inner.zones.clone();
        child_inner.brk = parent_inner.brk;

        let mut batch = TlbFlushBatch::new();
        let pages: alloc::vec::Vec<(u64, PageSlot)> =
            parent_inner.pages.iter().map(|(k, v)| (*k, *v)).collect();
        for (va, slot) in pages {
            FRAME_ALLOCATOR.lock().ref_page(slot.frame)?;
            let zone_prot = Self::zone_containing(&parent_inner.zones, va)
                .map(|z| z.prot)
                .unwrap_or(Prot::READ);
            // Every shared frame becomes a CoW share on both sides, even in
            // currently read-only zones: a later protect-to-writable must
            // still fault and duplicate rather than alias.
            if !slot.cow {
                parent_inner.pages.insert(va, PageSlot { cow: true, ..slot });
                self.install_leaf(va, slot.frame, zone_prot, true)?;
                batch.add(va);
            }
            child_inner.pages.insert(
                va,
                PageSlot {
                    frame: slot.frame,
                    cow: true,
                },
            );
            child.install_leaf(va, slot.frame, zone_prot, true)?;
        }
        batch.commit(self);
        drop(child_inner);
        drop(parent_inner);
        Ok(child)
    }

    /// Tear down every user mapping. Called on exec and from `Drop`.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let pages: alloc::vec::Vec<(u64, PageSlot)> =
            inner.pages.iter().map(|(k, v)| (*k, *v)).collect();
        for (_va, slot) in &pages {
            FRAME_ALLOCATOR.lock().free_page(slot.frame);
        }
        inner.pages.clear();
        inner.zones.clear();
        inner.brk = HEAP_BASE;
        #[cfg(target_os = "none")]
        {
            let root = self.root();
            if root != 0 {
                super::page_table::free_user_subtrees(super::PhysAddr::new(root));
            }
            crate::arch::tlb_flush_all();
        }
    }

    /// Adjust the heap break, growing or shrinking the heap zone.
    pub fn set_brk(&self, new_brk: u64) -> KernelResult<u64> {
        let mut inner = self.inner.lock();
        if new_brk == 0 {
            return Ok(inner.brk);
        }
        if new_brk < HEAP_BASE || new_brk >= MMAP_BASE {
            return Err(KernelError::OutOfMemory);
        }
        let old = inner.brk;
        let old_end = page_round_up(old as usize) as u64;
        let new_end = page_round_up(new_brk as usize) as u64;
        if new_end > old_end {
            if Self::overlaps(&inner.zones, old_end, (new_end - old_end) as usize) {
                return Err(KernelError::OutOfMemory);
            }
            inner.zones.insert(
                old_end,
                Zone {
                    base: old_end,
                    len: (new_end - old_end) as usize,
                    prot: Prot::READ | Prot::WRITE,
                    flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                    file: None,
                },
            );
        } else if new_end < old_end {
            self.unmap_locked(&mut inner, new_end, (old_end - new_end) as usize)?;
        }
        inner.brk = new_brk;
        Ok(new_brk)
    }

    /// Current heap break.
    pub fn brk(&self) -> u64 {
        self.inner.lock().brk
    }

    /// Frame backing `addr`, if present (no fault-in).
    pub fn lookup_page(&self, addr: u64) -> Option<FrameIdx> {
        let page = addr & !(PAGE_SIZE as u64 - 1);
        self.inner.lock().pages.get(&page).map(|s| s.frame)
    }

    /// The zone containing `addr`, cloned.
    pub fn zone_at(&self, addr: u64) -> Option<Zone> {
        Self::zone_containing(&self.inner.lock().zones, addr).cloned()
    }

    /// Number of zones (diagnostics and tests).
    pub fn zone_count(&self) -> usize {
        self.inner.lock().zones.len()
    }

    /// Check the non-overlap invariant over the whole zone set.
    pub fn check_zones_disjoint(&self) -> bool {
        let inner = self.inner.lock();
        let mut prev_end = 0u64;
        for zone in inner.zones.values() {
            if zone.base < prev_end {
                return false;
            }
            prev_end = zone.end();
        }
        true
    }

    /// Validate that `[addr, addr + len)` lies within zones granting
    /// `access`. Used by the user-copy primitives before touching bytes.
    pub fn check_user_range(&self, addr: u64, len: usize, access: Access) -> KernelResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len as u64).ok_or(KernelError::BadAddress {
            addr: addr as usize,
        })?;
        if addr < USER_BASE || end > USER_TOP {
            return Err(KernelError::BadAddress {
                addr: addr as usize,
            });
        }
        let inner = self.inner.lock();
        let mut cursor = addr;
        while cursor < end {
            let zone = Self::zone_containing(&inner.zones, cursor).ok_or(
                KernelError::BadAddress {
                    addr: cursor as usize,
                },
            )?;
            let allowed = match access {
                Access::Read => zone.prot.contains(Prot::READ),
                Access::Write => zone.prot.contains(Prot::WRITE),
                Access::Exec => zone.prot.contains(Prot::EXEC),
            };
            if !allowed {
                return Err(KernelError::BadAddress {
                    addr: cursor as usize,
                });
            }
            cursor = zone.end();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn zone_containing<'a>(zones: &'a BTreeMap<u64, Zone>, addr: u64) -> Option<&'a Zone> {
        zones
            .range(..=addr)
            .next_back()
            .map(|(_, z)| z)
            .filter(|z| z.contains(addr))
    }

    fn overlaps(zones: &BTreeMap<u64, Zone>, base: u64, len: usize) -> bool {
        let end = base + len as u64;
        if let Some((_, prev)) = zones.range(..base).next_back() {
            if prev.end() > base {
                return true;
            }
        }
        zones.range(base..end).next().is_some()
    }

    fn find_free(zones: &BTreeMap<u64, Zone>, preferred: u64, len: usize) -> Option<u64> {
        if preferred >= USER_BASE
            && preferred + (len as u64) <= USER_TOP
            && !Self::overlaps(zones, preferred, len)
        {
            return Some(preferred);
        }
        // First-fit scan from the mmap origin.
        let mut cursor = MMAP_BASE;
        if let Some((_, prev)) = zones.range(..MMAP_BASE).next_back() {
            cursor = cursor.max(prev.end());
        }
        for zone in zones.range(MMAP_BASE..).map(|(_, z)| z) {
            if zone.base >= cursor + len as u64 {
                break;
            }
            cursor = cursor.max(zone.end());
        }
        (cursor + (len as u64) <= USER_TOP).then_some(cursor)
    }

    /// Split the zone containing `addr` so that `addr` becomes a zone
    /// boundary. No-op if `addr` already is one, or lies in a hole.
    fn split_at(zones: &mut BTreeMap<u64, Zone>, addr: u64) {
        let Some((base, zone)) = zones
            .range(..addr)
            .next_back()
            .map(|(b, z)| (*b, z.clone()))
        else {
            return;
        };
        if !zone.contains(addr) || zone.base == addr {
            return;
        }
        let head_len = (addr - zone.base) as usize;
        let tail = Zone {
            base: addr,
            len: zone.len - head_len,
            prot: zone.prot,
            flags: zone.flags,
            file: zone.file.as_ref().map(|zf| ZoneFile {
                file: zf.file.clone(),
                offset: zf.offset + head_len as u64,
            }),
        };
        zones.get_mut(&base).unwrap().len = head_len;
        zones.insert(addr, tail);
    }

    fn unmap_locked(&self, inner: &mut SpaceInner, addr: u64, len: usize) -> KernelResult<()> {
        let end = addr + len as u64;
        Self::split_at(&mut inner.zones, addr);
        Self::split_at(&mut inner.zones, end);
        let doomed: alloc::vec::Vec<u64> = inner.zones.range(addr..end).map(|(b, _)| *b).collect();
        for base in doomed {
            inner.zones.remove(&base);
        }

        let mut batch = TlbFlushBatch::new();
        let pages: alloc::vec::Vec<(u64, PageSlot)> = inner
            .pages
            .range(addr..end)
            .map(|(k, v)| (*k, *v))
            .collect();
        #[cfg(target_os = "none")]
        let root = self.root();
        for (va, slot) in pages {
            FRAME_ALLOCATOR.lock().free_page(slot.frame);
            inner.pages.remove(&va);
            #[cfg(target_os = "none")]
            super::page_table::unmap_leaf(super::PhysAddr::new(root), va);
            batch.add(va);
        }
        batch.commit(self);
        Ok(())
    }

    /// Mirror a leaf into the hardware tree (bare metal only).
    #[allow(unused_variables)]
    fn install_leaf(&self, va: u64, frame: FrameIdx, prot: Prot, cow: bool) -> KernelResult<()> {
        #[cfg(target_os = "none")]
        {
            let root = super::PhysAddr::new(self.root());
            let flags = entry_flags_for(prot, cow);
            super::page_table::unmap_leaf(root, va);
            super::page_table::map_leaf(root, va, frame, flags)?;
        }
        Ok(())
    }

    /// Duplicate a frame's contents into a fresh frame.
    fn duplicate_frame(&self, src: FrameIdx) -> KernelResult<FrameIdx> {
        let dst = FRAME_ALLOCATOR.lock().alloc_page()?;
        #[cfg(target_os = "none")]
        crate::arch::vm::copy_frame(dst, src);
        #[cfg(not(target_os = "none"))]
        let _ = src;
        Ok(dst)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.clear();
        #[cfg(target_os = "none")]
        {
            let root = self.root.swap(0, Ordering::AcqRel);
            if root != 0 {
                super::page_table::free_user_tree(super::PhysAddr::new(root));
            }
        }
    }
}

/// Translate a zone protection into hardware entry bits.
///
/// The PAT is pre-programmed so that (PAT, PCD, PWT) select: 00 =
/// write-through (the default), PWT = write-back, PCD = strong
/// uncacheable, PCD|PWT = write-combining.
pub fn entry_flags_for(prot: Prot, cow: bool) -> EntryFlags {
    let mut flags = EntryFlags::PRESENT | EntryFlags::USER;
    if prot.contains(Prot::WRITE) && !cow {
        flags |= EntryFlags::WRITABLE;
    }
    if !prot.contains(Prot::EXEC) {
        flags |= EntryFlags::NO_EXECUTE;
    }
    if cow {
        flags |= EntryFlags::COW;
    }
    if prot.contains(Prot::UNCACHED) {
        flags |= EntryFlags::NO_CACHE;
    } else if prot.contains(Prot::WRITE_COMBINE) {
        flags |= EntryFlags::NO_CACHE | EntryFlags::WRITE_THROUGH;
    } else if prot.contains(Prot::WRITE_BACK) {
        flags |= EntryFlags::WRITE_THROUGH;
    }
    flags
}

#[cfg(test)]
pub mod test_support {
    //! Shared setup for tests that exercise the global frame allocator.

    use spin::{Mutex, MutexGuard, Once};

    use super::super::frame::{MemRegion, FRAME_ALLOCATOR};
    use super::super::FrameIdx;

    static INIT: Once = Once::new();
    static LOCK: Mutex<()> = Mutex::new(());

    /// Serialize allocator-sensitive tests and seed the global allocator.
    pub fn lock() -> MutexGuard<'static, ()> {
        INIT.call_once(|| {
            FRAME_ALLOCATOR.lock().add_region(MemRegion {
                start: FrameIdx::new(0x1000),
                count: 4096,
            });
        });
        LOCK.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_flags() -> MapFlags {
        MapFlags::PRIVATE | MapFlags::ANONYMOUS
    }

    #[test]
    fn map_rejects_wx() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let err = space.map(
            0,
            0,
            PAGE_SIZE,
            Prot::READ | Prot::WRITE | Prot::EXEC,
            anon_flags(),
            None,
        );
        assert_eq!(err, Err(KernelError::Invalid));
    }

    #[test]
    fn map_rejects_shared_and_requires_one_sharing_mode() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        assert_eq!(
            space.map(
                0,
                0,
                PAGE_SIZE,
                Prot::READ,
                MapFlags::SHARED | MapFlags::ANONYMOUS,
                None
            ),
            Err(KernelError::Invalid)
        );
        assert_eq!(
            space.map(0, 0, PAGE_SIZE, Prot::READ, MapFlags::ANONYMOUS, None),
            Err(KernelError::Invalid)
        );
        assert_eq!(
            space.map(
                0,
                0,
                PAGE_SIZE,
                Prot::READ,
                MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None
            ),
            Err(KernelError::Invalid)
        );
    }

    #[test]
    fn map_rejects_conflicting_cache_modes() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        assert_eq!(
            space.map(
                0,
                0,
                PAGE_SIZE,
                Prot::READ | Prot::UNCACHED | Prot::WRITE_BACK,
                anon_flags(),
                None
            ),
            Err(KernelError::Invalid)
        );
    }

    #[test]
    fn non_fixed_hint_is_advisory() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let a = space
            .map(0, 0, PAGE_SIZE, Prot::READ | Prot::WRITE, anon_flags(), None)
            .unwrap();
        assert_eq!(a % PAGE_SIZE as u64, 0);
        // A hint inside the existing zone falls back to a free range.
        let b = space
            .map(a, 0, PAGE_SIZE, Prot::READ | Prot::WRITE, anon_flags(), None)
            .unwrap();
        assert_ne!(a, b);
        assert!(space.check_zones_disjoint());
    }

    #[test]
    fn fixed_excl_rejects_overlap() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = MMAP_BASE + 0x10_0000;
        space
            .map(
                base,
                0,
                4 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                anon_flags() | MapFlags::FIXED,
                None,
            )
            .unwrap();
        let err = space.map(
            base + PAGE_SIZE as u64,
            0,
            PAGE_SIZE,
            Prot::READ,
            anon_flags() | MapFlags::FIXED | MapFlags::EXCL,
            None,
        );
        assert_eq!(err, Err(KernelError::Invalid));
    }

    #[test]
    fn fixed_without_excl_replaces_overlap() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = MMAP_BASE + 0x20_0000;
        space
            .map(
                base,
                0,
                4 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                anon_flags() | MapFlags::FIXED,
                None,
            )
            .unwrap();
        let got = space
            .map(
                base + PAGE_SIZE as u64,
                0,
                PAGE_SIZE,
                Prot::READ,
                anon_flags() | MapFlags::FIXED,
                None,
            )
            .unwrap();
        assert_eq!(got, base + PAGE_SIZE as u64);
        assert!(space.check_zones_disjoint());
        // The middle page now belongs to the read-only zone.
        let z = space.zone_at(got).unwrap();
        assert_eq!(z.prot(), Prot::READ);
    }

    #[test]
    fn unmap_splits_zones() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(
                0,
                0,
                4 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                anon_flags(),
                None,
            )
            .unwrap();
        // Punch a hole in the middle.
        space.unmap(base + PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert_eq!(space.zone_count(), 2);
        assert!(space.zone_at(base).is_some());
        assert!(space.zone_at(base + PAGE_SIZE as u64).is_none());
        assert!(space.zone_at(base + 2 * PAGE_SIZE as u64).is_some());
        assert!(space.check_zones_disjoint());
    }

    #[test]
    fn populate_then_unmap_returns_frames() {
        let _g = test_support::lock();
        let before = FRAME_ALLOCATOR.lock().free_frames();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(
                0,
                0,
                2 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                anon_flags(),
                None,
            )
            .unwrap();
        space.populate_page(base, Access::Write).unwrap();
        space
            .populate_page(base + PAGE_SIZE as u64, Access::Read)
            .unwrap();
        assert_eq!(FRAME_ALLOCATOR.lock().free_frames(), before - 2);
        drop(space);
        assert_eq!(FRAME_ALLOCATOR.lock().free_frames(), before);
    }

    #[test]
    fn populate_respects_zone_protection() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(0, 0, PAGE_SIZE, Prot::READ, anon_flags(), None)
            .unwrap();
        assert!(space.populate_page(base, Access::Read).is_ok());
        assert!(matches!(
            space.populate_page(base, Access::Write),
            Err(KernelError::BadAddress { .. })
        ));
    }

    #[test]
    fn fork_shares_frames_and_preserves_counts() {
        let _g = test_support::lock();
        let before = FRAME_ALLOCATOR.lock().free_frames();
        let parent = AddressSpace::new().unwrap();
        let base = parent
            .map(
                0,
                0,
                3 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                anon_flags(),
                None,
            )
            .unwrap();
        for i in 0..3u64 {
            parent
                .populate_page(base + i * PAGE_SIZE as u64, Access::Write)
                .unwrap();
        }
        let child = parent.fork().unwrap();
        // Shared, not copied.
        assert_eq!(FRAME_ALLOCATOR.lock().free_frames(), before - 3);
        let f = parent.lookup_page(base).unwrap();
        assert_eq!(FRAME_ALLOCATOR.lock().get_page(f), Some(2));
        // Destroying the child restores the counts exactly.
        drop(child);
        assert_eq!(FRAME_ALLOCATOR.lock().free_frames(), before - 3);
        assert_eq!(FRAME_ALLOCATOR.lock().get_page(f), Some(1));
        drop(parent);
        assert_eq!(FRAME_ALLOCATOR.lock().free_frames(), before);
    }

    #[test]
    fn cow_write_duplicates_frame() {
        let _g = test_support::lock();
        let parent = AddressSpace::new().unwrap();
        let base = parent
            .map(0, 0, PAGE_SIZE, Prot::READ | Prot::WRITE, anon_flags(), None)
            .unwrap();
        parent.populate_page(base, Access::Write).unwrap();
        let shared = parent.lookup_page(base).unwrap();
        let child = parent.fork().unwrap();
        assert_eq!(FRAME_ALLOCATOR.lock().get_page(shared), Some(2));

        // Child write faults and gets its own frame.
        let child_frame = child.populate_page(base, Access::Write).unwrap();
        assert_ne!(child_frame, shared);
        assert_eq!(FRAME_ALLOCATOR.lock().get_page(shared), Some(1));
        // Parent still sees the original frame.
        assert_eq!(parent.lookup_page(base), Some(shared));
    }

    #[test]
    fn protect_requires_full_coverage() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(0, 0, PAGE_SIZE, Prot::READ | Prot::WRITE, anon_flags(), None)
            .unwrap();
        assert_eq!(
            space.protect(base, 2 * PAGE_SIZE, Prot::READ),
            Err(KernelError::OutOfMemory)
        );
        assert!(space.protect(base, PAGE_SIZE, Prot::READ).is_ok());
        assert_eq!(space.zone_at(base).unwrap().prot(), Prot::READ);
    }

    #[test]
    fn protect_splits_partial_range() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(
                0,
                0,
                3 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                anon_flags(),
                None,
            )
            .unwrap();
        space
            .protect(base + PAGE_SIZE as u64, PAGE_SIZE, Prot::READ)
            .unwrap();
        assert_eq!(space.zone_count(), 3);
        assert_eq!(space.zone_at(base).unwrap().prot(), Prot::READ | Prot::WRITE);
        assert_eq!(
            space.zone_at(base + PAGE_SIZE as u64).unwrap().prot(),
            Prot::READ
        );
        assert!(space.check_zones_disjoint());
    }

    #[test]
    fn brk_grows_and_shrinks_heap() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        assert_eq!(space.set_brk(0).unwrap(), HEAP_BASE);
        let new = HEAP_BASE + 3 * PAGE_SIZE as u64;
        assert_eq!(space.set_brk(new).unwrap(), new);
        assert!(space.zone_at(HEAP_BASE).is_some());
        assert_eq!(space.set_brk(HEAP_BASE).unwrap(), HEAP_BASE);
        assert!(space.zone_at(HEAP_BASE).is_none());
    }

    #[test]
    fn check_user_range_enforces_bounds_and_prot() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(0, 0, 2 * PAGE_SIZE, Prot::READ, anon_flags(), None)
            .unwrap();
        assert!(space.check_user_range(base, PAGE_SIZE, Access::Read).is_ok());
        assert!(space
            .check_user_range(base, 2 * PAGE_SIZE + 1, Access::Read)
            .is_err());
        assert!(space.check_user_range(base, 8, Access::Write).is_err());
        assert!(space.check_user_range(0, 8, Access::Read).is_err());
    }

    #[test]
    fn entry_flags_translation() {
        let f = entry_flags_for(Prot::READ | Prot::WRITE, false);
        assert!(f.contains(EntryFlags::WRITABLE));
        assert!(f.contains(EntryFlags::NO_EXECUTE));
        // CoW masks writability.
        let f = entry_flags_for(Prot::READ | Prot::WRITE, true);
        assert!(!f.contains(EntryFlags::WRITABLE));
        assert!(f.contains(EntryFlags::COW));
        // Exec clears NX.
        let f = entry_flags_for(Prot::READ | Prot::EXEC, false);
        assert!(!f.contains(EntryFlags::NO_EXECUTE));
        // Cache modes.
        let f = entry_flags_for(Prot::READ | Prot::UNCACHED, false);
        assert!(f.contains(EntryFlags::NO_CACHE));
        assert!(!f.contains(EntryFlags::WRITE_THROUGH));
        let f = entry_flags_for(Prot::READ | Prot::WRITE_COMBINE, false);
        assert!(f.contains(EntryFlags::NO_CACHE | EntryFlags::WRITE_THROUGH));
    }
}
