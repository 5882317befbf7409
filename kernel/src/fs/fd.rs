//! File descriptor table
//!
//! A slot pairs an open file with its close-on-exec flag. The flag lives
//! in the slot, not the file, so duplicated descriptors carry independent
//! CLOEXEC state while sharing the offset.

use alloc::{sync::Arc, vec::Vec};

use crate::error::{KernelError, KernelResult};

use super::{OpenFile, OpenFlags};

/// Hard cap on descriptors per process.
pub const MAX_FDS: usize = 1024;

bitflags::bitflags! {
    /// Per-slot flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FdFlags: u32 {
        const CLOEXEC = 1 << 0;
    }
}

#[derive(Clone)]
struct FdSlot {
    file: Arc<OpenFile>,
    flags: FdFlags,
}

/// The per-process descriptor table, guarded by the process's rwlock.
#[derive(Default)]
pub struct FdTable {
    slots: Vec<Option<FdSlot>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `file` at the lowest free descriptor.
    pub fn alloc(&mut self, file: Arc<OpenFile>, flags: FdFlags) -> KernelResult<usize> {
        let fd = match self.slots.iter().position(|s| s.is_none()) {
            Some(fd) => fd,
            None => {
                if self.slots.len() >= MAX_FDS {
                    return Err(KernelError::OutOfMemory);
                }
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[fd] = Some(FdSlot { file, flags });
        Ok(fd)
    }

    /// Install `file` at exactly `fd`, closing whatever was there.
    pub fn install_at(
        &mut self,
        fd: usize,
        file: Arc<OpenFile>,
        flags: FdFlags,
    ) -> KernelResult<usize> {
        if fd >= MAX_FDS {
            return Err(KernelError::BadFd);
        }
        if fd >= self.slots.len() {
            self.slots.resize(fd + 1, None);
        }
        self.slots[fd] = Some(FdSlot { file, flags });
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> KernelResult<Arc<OpenFile>> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|s| s.file.clone())
            .ok_or(KernelError::BadFd)
    }

    pub fn close(&mut self, fd: usize) -> KernelResult<()> {
        match self.slots.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::BadFd),
        }
    }

    /// `dup`: lowest free descriptor sharing the open file; the new slot's
    /// CLOEXEC flag starts clear.
    pub fn dup(&mut self, fd: usize) -> KernelResult<usize> {
        let file = self.get(fd)?;
        self.alloc(file, FdFlags::empty())
    }

    /// `dup3`: duplicate onto `new_fd` with explicit flags.
    pub fn dup3(&mut self, old_fd: usize, new_fd: usize, flags: FdFlags) -> KernelResult<usize> {
        if old_fd == new_fd {
            return Err(KernelError::Invalid);
        }
        let file = self.get(old_fd)?;
        self.install_at(new_fd, file, flags)
    }

    pub fn fd_flags(&self, fd: usize) -> KernelResult<FdFlags> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|s| s.flags)
            .ok_or(KernelError::BadFd)
    }

    pub fn set_fd_flags(&mut self, fd: usize, flags: FdFlags) -> KernelResult<()> {
        match self.slots.get_mut(fd) {
            Some(Some(slot)) => {
                slot.flags = flags;
                Ok(())
            }
            _ => Err(KernelError::BadFd),
        }
    }

    /// Exec keeps only slots whose CLOEXEC flag is clear.
    pub fn close_on_exec(&mut self) {
        for slot in &mut self.slots {
            if matches!(slot, Some(s) if s.flags.contains(FdFlags::CLOEXEC)) {
                *slot = None;
            }
        }
    }

    /// Fork copies every slot (files shared, flags copied).
    pub fn clone_for_fork(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Flags for a fresh descriptor derived from the open flags.
pub fn fd_flags_from_open(flags: OpenFlags) -> FdFlags {
    if flags.contains(OpenFlags::CLOEXEC) {
        FdFlags::CLOEXEC
    } else {
        FdFlags::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileOps, PollEvents};

    struct NullFile;

    impl FileOps for NullFile {
        fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
            Ok(0)
        }
        fn write(&self, _offset: u64, buf: &[u8]) -> KernelResult<usize> {
            Ok(buf.len())
        }
        fn poll_ready(&self, mask: PollEvents) -> PollEvents {
            mask
        }
    }

    fn open_null() -> Arc<OpenFile> {
        OpenFile::new(Arc::new(NullFile), OpenFlags::RDWR)
    }

    #[test]
    fn alloc_reuses_lowest_free_slot() {
        let mut table = FdTable::new();
        let a = table.alloc(open_null(), FdFlags::empty()).unwrap();
        let b = table.alloc(open_null(), FdFlags::empty()).unwrap();
        let c = table.alloc(open_null(), FdFlags::empty()).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        table.close(1).unwrap();
        assert_eq!(table.alloc(open_null(), FdFlags::empty()).unwrap(), 1);
    }

    #[test]
    fn close_invalidates_descriptor() {
        let mut table = FdTable::new();
        let fd = table.alloc(open_null(), FdFlags::empty()).unwrap();
        table.close(fd).unwrap();
        assert!(table.get(fd).is_err());
        assert!(table.close(fd).is_err());
    }

    #[test]
    fn exec_preserves_only_non_cloexec_slots() {
        let mut table = FdTable::new();
        let keep = table.alloc(open_null(), FdFlags::empty()).unwrap();
        let drop_fd = table.alloc(open_null(), FdFlags::CLOEXEC).unwrap();
        table.close_on_exec();
        assert!(table.get(keep).is_ok());
        assert!(table.get(drop_fd).is_err());
    }

    #[test]
    fn dup_clears_cloexec_on_the_new_slot() {
        let mut table = FdTable::new();
        let fd = table.alloc(open_null(), FdFlags::CLOEXEC).unwrap();
        let dup = table.dup(fd).unwrap();
        assert_eq!(table.fd_flags(dup).unwrap(), FdFlags::empty());
        assert_eq!(table.fd_flags(fd).unwrap(), FdFlags::CLOEXEC);
    }

    #[test]
    fn dup3_rejects_same_fd() {
        let mut table = FdTable::new();
        let fd = table.alloc(open_null(), FdFlags::empty()).unwrap();
        assert!(table.dup3(fd, fd, FdFlags::empty()).is_err());
        let target = 7;
        table.dup3(fd, target, FdFlags::CLOEXEC).unwrap();
        assert!(table.get(target).is_ok());
    }
}
