//! User-space memory crossing
//!
//! The system-call layer never dereferences user pointers directly; all
//! transfers go through these primitives, which validate the range against
//! the space's zones, fault pages in, and copy through the PMAP view of
//! the backing frames. Invalid user addresses fail cleanly with EFAULT.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{string::String, vec::Vec};

use super::{
    space::{Access, AddressSpace},
    FrameIdx, PAGE_SIZE,
};
use crate::error::{KernelError, KernelResult};

/// Longest C string `copystr` accepts, terminator included.
pub const MAX_STR_LEN: usize = 4096;
/// Most entries `verifystra` accepts in a pointer array.
pub const MAX_ARRAY_LEN: usize = 1024;

/// Walk `[addr, addr + len)` page by page, faulting each page in with the
/// required access and handing `(frame, page_offset, chunk_len, buf_offset)`
/// to the callback.
fn with_pages(
    space: &AddressSpace,
    addr: u64,
    len: usize,
    access: Access,
    mut f: impl FnMut(FrameIdx, usize, usize, usize) -> KernelResult<()>,
) -> KernelResult<()> {
    space.check_user_range(addr, len, access)?;
    let mut done = 0usize;
    while done < len {
        let cur = addr + done as u64;
        let page_off = (cur % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(len - done);
        let frame = space.populate_page(cur, access)?;
        f(frame, page_off, chunk, done)?;
        done += chunk;
    }
    Ok(())
}

/// Copy bytes from user space into a kernel buffer.
pub fn copyin(space: &AddressSpace, user_addr: u64, buf: &mut [u8]) -> KernelResult<()> {
    with_pages(space, user_addr, buf.len(), Access::Read, |_frame, _off, chunk, dst| {
        #[cfg(target_os = "none")]
        // SAFETY: the frame is live (refcounted by this space) and mapped
        // through the PMAP; the chunk stays within one page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                super::frame_ptr(_frame).add(_off),
                buf[dst..dst + chunk].as_mut_ptr(),
                chunk,
            );
        }
        #[cfg(not(target_os = "none"))]
        buf[dst..dst + chunk].fill(0);
        Ok(())
    })
}

/// Copy bytes from a kernel buffer out to user space.
pub fn copyout(space: &AddressSpace, user_addr: u64, buf: &[u8]) -> KernelResult<()> {
    with_pages(space, user_addr, buf.len(), Access::Write, |_frame, _off, chunk, src| {
        #[cfg(target_os = "none")]
        // SAFETY: as in `copyin`; the destination frame was faulted in
        // with write access.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf[src..src + chunk].as_ptr(),
                super::frame_ptr(_frame).add(_off),
                chunk,
            );
        }
        #[cfg(not(target_os = "none"))]
        let _ = (chunk, src);
        Ok(())
    })
}

/// Scan one page's worth of string bytes; returns true once the NUL
/// terminator was seen.
#[cfg(target_os = "none")]
fn scan_str_page(frame: FrameIdx, page_off: usize, chunk: usize, bytes: &mut Vec<u8>) -> bool {
    // SAFETY: live frame via the PMAP; the chunk stays within one page.
    let page =
        unsafe { core::slice::from_raw_parts(super::frame_ptr(frame).add(page_off), chunk) };
    for &b in page {
        if b == 0 {
            return true;
        }
        bytes.push(b);
    }
    false
}

/// Host frames carry no contents; anonymous pages read as zero, so the
/// terminator is found immediately.
#[cfg(not(target_os = "none"))]
fn scan_str_page(_frame: FrameIdx, _page_off: usize, _chunk: usize, _bytes: &mut Vec<u8>) -> bool {
    true
}

/// Copy a NUL-terminated string from user space, bounded by
/// [`MAX_STR_LEN`]. Non-UTF-8 content fails with EILSEQ.
pub fn copystr(space: &AddressSpace, user_addr: u64) -> KernelResult<String> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut scanned = 0usize;
    loop {
        if scanned >= MAX_STR_LEN {
            return Err(KernelError::OutOfRange);
        }
        let cur = user_addr + scanned as u64;
        let page_off = (cur % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(MAX_STR_LEN - scanned);
        space.check_user_range(cur, 1, Access::Read)?;
        let frame = space.populate_page(cur, Access::Read)?;
        if scan_str_page(frame, page_off, chunk, &mut bytes) {
            break;
        }
        scanned += chunk;
    }
    String::from_utf8(bytes).map_err(|_| KernelError::IllegalSequence)
}

/// Read a NUL-terminated array of user string pointers (argv/envp shape),
/// validating and copying every referenced string.
pub fn verifystra(space: &AddressSpace, user_addr: u64) -> KernelResult<Vec<String>> {
    let mut out = Vec::new();
    for i in 0..MAX_ARRAY_LEN as u64 {
        let slot_addr = user_addr
            .checked_add(i * 8)
            .ok_or(KernelError::BadAddress {
                addr: user_addr as usize,
            })?;
        let mut raw = [0u8; 8];
        copyin(space, slot_addr, &mut raw)?;
        let ptr = u64::from_le_bytes(raw);
        if ptr == 0 {
            return Ok(out);
        }
        out.push(copystr(space, ptr)?);
    }
    Err(KernelError::OutOfRange)
}

/// A temporary kernel-side view of a user range: the backing frames,
/// faulted in and pinned by the space's own refcounts for the duration of
/// the borrow.
pub struct UserWindow {
    frames: Vec<(FrameIdx, usize, usize)>,
    len: usize,
}

impl UserWindow {
    /// Number of bytes covered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate `(frame, page_offset, chunk_len)` in address order.
    pub fn chunks(&self) -> impl Iterator<Item = &(FrameIdx, usize, usize)> {
        self.frames.iter()
    }
}

/// Map a user range for in-kernel access (the `map_user` primitive).
pub fn map_user(
    space: &AddressSpace,
    user_addr: u64,
    len: usize,
    access: Access,
) -> KernelResult<UserWindow> {
    let mut frames = Vec::new();
    with_pages(space, user_addr, len, access, |frame, off, chunk, _| {
        frames.push((frame, off, chunk));
        Ok(())
    })?;
    Ok(UserWindow { frames, len })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{space::test_support, MapFlags, Prot};

    fn space_with_rw_page() -> (AddressSpace, u64) {
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(
                0,
                0,
                2 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
            )
            .unwrap();
        (space, base)
    }

    #[test]
    fn copyin_rejects_unmapped_range() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            copyin(&space, 0x5000_0000, &mut buf),
            Err(KernelError::BadAddress { .. })
        ));
    }

    #[test]
    fn copyin_reads_zero_filled_anonymous_pages() {
        let _g = test_support::lock();
        let (space, base) = space_with_rw_page();
        let mut buf = [0xAAu8; 32];
        copyin(&space, base, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn copyout_faults_pages_in() {
        let _g = test_support::lock();
        let (space, base) = space_with_rw_page();
        assert!(space.lookup_page(base).is_none());
        copyout(&space, base + 8, &[1, 2, 3, 4]).unwrap();
        assert!(space.lookup_page(base).is_some());
    }

    #[test]
    fn copyout_spanning_two_pages() {
        let _g = test_support::lock();
        let (space, base) = space_with_rw_page();
        let buf = [7u8; 64];
        copyout(&space, base + PAGE_SIZE as u64 - 32, &buf).unwrap();
        assert!(space.lookup_page(base).is_some());
        assert!(space.lookup_page(base + PAGE_SIZE as u64).is_some());
    }

    #[test]
    fn copyout_rejects_read_only_zone() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        let base = space
            .map(
                0,
                0,
                PAGE_SIZE,
                Prot::READ,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
            )
            .unwrap();
        assert!(copyout(&space, base, &[1]).is_err());
    }

    #[test]
    fn map_user_pins_whole_range() {
        let _g = test_support::lock();
        let (space, base) = space_with_rw_page();
        let window = map_user(&space, base + 100, PAGE_SIZE, Access::Write).unwrap();
        assert_eq!(window.len(), PAGE_SIZE);
        assert_eq!(window.chunks().count(), 2);
    }

    #[test]
    fn copystr_rejects_bad_pointer() {
        let _g = test_support::lock();
        let space = AddressSpace::new().unwrap();
        assert!(copystr(&space, 0x1234_5000).is_err());
    }
}
