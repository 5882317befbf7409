//! File layer
//!
//! The kernel core is VFS-agnostic: a file is anything implementing
//! [`FileOps`], selected at runtime (the capability-set form of the old
//! function-pointer op tables). This module provides the fd table with
//! close-on-exec slots, pipes, and a small in-memory node registry that
//! backs `openat`/`getdents` and the read-only ACPI table files.

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod fd;
pub mod pipe;
pub mod ramfs;

pub use fd::{FdFlags, FdTable};
pub use pipe::Pipe;
pub use ramfs::RamFs;

use alloc::{string::String, sync::Arc};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    sched::WaitQueue,
};

bitflags::bitflags! {
    /// Readiness event mask for poll/select.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u16 {
        const IN   = 1 << 0;
        const OUT  = 1 << 2;
        const ERR  = 1 << 3;
        const HUP  = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Open-file status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY    = 0;
        const WRONLY    = 1 << 0;
        const RDWR      = 1 << 1;
        const CREAT     = 1 << 6;
        const EXCL      = 1 << 7;
        const TRUNC     = 1 << 9;
        const APPEND    = 1 << 10;
        const NONBLOCK  = 1 << 11;
        const DIRECTORY = 1 << 16;
        const CLOEXEC   = 1 << 19;
    }
}

/// The per-object operation set.
///
/// Offsets are managed by the [`OpenFile`] wrapper; stream-like objects
/// (pipes, sockets) ignore them.
pub trait FileOps: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize>;

    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize>;

    fn ioctl(&self, _cmd: u32, _arg: usize) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    /// Readiness now, without blocking.
    fn poll_ready(&self, mask: PollEvents) -> PollEvents;

    /// Sleep queue poked on readiness changes, when the object has one.
    fn waitq(&self) -> Option<&WaitQueue> {
        None
    }

    /// Byte size for seekable objects.
    fn size(&self) -> u64 {
        0
    }

    fn is_dir(&self) -> bool {
        false
    }

    /// Directory entry at `pos`: `(name, is_dir)`.
    fn readdir(&self, _pos: usize) -> Option<(String, bool)> {
        None
    }

    /// Whether lseek applies.
    fn seekable(&self) -> bool {
        true
    }

    /// The mmap seam: objects that can back a zone return themselves as
    /// a [`crate::mm::space::VmFile`].
    fn vm_file(self: Arc<Self>) -> Option<Arc<dyn crate::mm::space::VmFile>> {
        None
    }
}

/// An open file: ops plus the shared seek offset and status flags.
///
/// `dup` clones the `Arc`, so duplicated descriptors share the offset,
/// as POSIX requires.
pub struct OpenFile {
    pub ops: Arc<dyn FileOps>,
    offset: Mutex<u64>,
    pub flags: Mutex<OpenFlags>,
}

impl OpenFile {
    pub fn new(ops: Arc<dyn FileOps>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            ops,
            offset: Mutex::new(0),
            flags: Mutex::new(flags),
        })
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    /// Read at the current offset, advancing it for seekable objects.
    pub fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        if self.ops.seekable() {
            let mut off = self.offset.lock();
            let n = self.ops.read(*off, buf)?;
            *off += n as u64;
            Ok(n)
        } else {
            self.ops.read(0, buf)
        }
    }

    /// Write at the current offset (or the end with O_APPEND).
    pub fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        if self.ops.seekable() {
            let mut off = self.offset.lock();
            if self.flags.lock().contains(OpenFlags::APPEND) {
                *off = self.ops.size();
            }
            let n = self.ops.write(*off, buf)?;
            *off += n as u64;
            Ok(n)
        } else {
            self.ops.write(0, buf)
        }
    }

    /// lseek. `whence`: 0 = SET, 1 = CUR, 2 = END.
    pub fn seek(&self, pos: i64, whence: u32) -> KernelResult<u64> {
        if !self.ops.seekable() {
            return Err(KernelError::NotSupported);
        }
        let mut off = self.offset.lock();
        let base = match whence {
            0 => 0i64,
            1 => *off as i64,
            2 => self.ops.size() as i64,
            _ => return Err(KernelError::Invalid),
        };
        let target = base.checked_add(pos).ok_or(KernelError::Invalid)?;
        if target < 0 {
            return Err(KernelError::Invalid);
        }
        *off = target as u64;
        Ok(*off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct FixedFile {
        data: Vec<u8>,
    }

    impl FileOps for FixedFile {
        fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
            let off = offset as usize;
            if off >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - off);
            buf[..n].copy_from_slice(&self.data[off..off + n]);
            Ok(n)
        }

        fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
            Err(KernelError::ReadOnlyFs)
        }

        fn poll_ready(&self, mask: PollEvents) -> PollEvents {
            mask & PollEvents::IN
        }

        fn size(&self) -> u64 {
            self.data.len() as u64
        }
    }

    #[test]
    fn offset_advances_and_is_shared_by_dup() {
        let ops = Arc::new(FixedFile {
            data: alloc::vec![1, 2, 3, 4, 5, 6],
        });
        let file = OpenFile::new(ops, OpenFlags::RDONLY);
        let dup = file.clone();

        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        // The duplicate sees the advanced offset.
        assert_eq!(dup.offset(), 4);
        // Dropping the duplicate leaves the original untouched.
        drop(dup);
        assert_eq!(file.offset(), 4);
        let mut rest = [0u8; 4];
        assert_eq!(file.read(&mut rest).unwrap(), 2);
        assert_eq!(&rest[..2], &[5, 6]);
    }

    #[test]
    fn seek_whence_forms() {
        let ops = Arc::new(FixedFile {
            data: alloc::vec![0; 100],
        });
        let file = OpenFile::new(ops, OpenFlags::RDONLY);
        assert_eq!(file.seek(10, 0).unwrap(), 10);
        assert_eq!(file.seek(5, 1).unwrap(), 15);
        assert_eq!(file.seek(-20, 2).unwrap(), 80);
        assert!(file.seek(-200, 1).is_err());
        assert!(file.seek(0, 9).is_err());
    }
}
