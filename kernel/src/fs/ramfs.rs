//! In-memory node registry
//!
//! The minimal collaborator behind `openat`/`getdents`: a flat map of
//! absolute paths to file or directory nodes. It also serves the
//! read-only ACPI table files and the boot archive the first exec loads
//! from. A real VFS is explicitly out of scope.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use spin::{Mutex, RwLock};

use crate::error::{KernelError, KernelResult};
use crate::mm::space::VmFile;

use super::{FileOps, OpenFlags, PollEvents};

/// Permission bits of a node, already masked by the creating process's
/// umask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(pub u32);

/// A regular in-memory file.
pub struct RamFile {
    data: RwLock<Vec<u8>>,
    read_only: bool,
    pub mode: Mode,
}

impl RamFile {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(Vec::new()),
            read_only: false,
            mode,
        })
    }

    /// A read-only file with fixed contents (ACPI tables, boot archive
    /// members).
    pub fn fixed(contents: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: RwLock::new(contents),
            read_only: true,
            mode: Mode(0o444),
        })
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Whole-file snapshot (used by exec to parse images).
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn truncate(&self) {
        self.data.write().clear();
    }

    /// Resize to exactly `len` bytes, zero-filling growth.
    pub fn truncate_to(&self, len: usize) -> KernelResult<()> {
        if self.read_only {
            return Err(KernelError::ReadOnlyFs);
        }
        self.data.write().resize(len, 0);
        Ok(())
    }
}

impl FileOps for RamFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let data = self.data.read();
        let off = offset as usize;
        if off >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        if self.read_only {
            return Err(KernelError::ReadOnlyFs);
        }
        let mut data = self.data.write();
        let off = offset as usize;
        if off + buf.len() > data.len() {
            data.resize(off + buf.len(), 0);
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn poll_ready(&self, mask: PollEvents) -> PollEvents {
        // Regular files are always ready.
        mask & (PollEvents::IN | PollEvents::OUT)
    }

    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn vm_file(self: Arc<Self>) -> Option<Arc<dyn VmFile>> {
        Some(self)
    }
}

impl VmFile for RamFile {
    fn read_page(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let n = FileOps::read(self, offset, buf)?;
        buf[n..].fill(0);
        Ok(n)
    }
}

/// A directory node; entries are resolved through the registry.
pub struct RamDir {
    path: String,
}

impl FileOps for RamDir {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::IsDirectory)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::IsDirectory)
    }

    fn poll_ready(&self, _mask: PollEvents) -> PollEvents {
        PollEvents::empty()
    }

    fn is_dir(&self) -> bool {
        true
    }

    fn readdir(&self, pos: usize) -> Option<(String, bool)> {
        REGISTRY.lock().list(&self.path).into_iter().nth(pos)
    }
}

enum Node {
    File(Arc<RamFile>),
    Dir,
}

/// Path-keyed node registry.
struct Registry {
    nodes: BTreeMap<String, Node>,
}

impl Registry {
    fn normalize(path: &str) -> String {
        let mut out = String::from("/");
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if !out.ends_with('/') {
                out.push('/');
            }
            out.push_str(comp);
        }
        out
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rfind('/') {
            Some(0) | None => true,
            Some(idx) => matches!(self.nodes.get(&path[..idx]), Some(Node::Dir)),
        }
    }

    fn list(&self, dir: &str) -> Vec<(String, bool)> {
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            let mut p = dir.to_string();
            p.push('/');
            p
        };
        self.nodes
            .iter()
            .filter_map(|(path, node)| {
                let rest = path.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    return None;
                }
                Some((rest.to_string(), matches!(node, Node::Dir)))
            })
            .collect()
    }
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    nodes: BTreeMap::new(),
});

/// The registry facade the syscall layer uses.
pub struct RamFs;

impl RamFs {
    /// Create a directory (and nothing else) at `path`.
    pub fn mkdir(path: &str) -> KernelResult<()> {
        let path = Registry::normalize(path);
        let mut reg = REGISTRY.lock();
        if reg.nodes.contains_key(&path) {
            return Err(KernelError::AlreadyExists);
        }
        if !reg.parent_exists(&path) {
            return Err(KernelError::NoEntry);
        }
        reg.nodes.insert(path, Node::Dir);
        Ok(())
    }

    /// Publish a fixed read-only file (ACPI tables, boot archive).
    pub fn publish(path: &str, contents: Vec<u8>) -> KernelResult<()> {
        let path = Registry::normalize(path);
        let mut reg = REGISTRY.lock();
        if !reg.parent_exists(&path) {
            return Err(KernelError::NoEntry);
        }
        reg.nodes.insert(path, Node::File(RamFile::fixed(contents)));
        Ok(())
    }

    /// The `openat` contract: `O_CREAT|O_EXCL` fails with EEXIST on an
    /// existing node; without `O_EXCL` an existing file opens normally;
    /// `O_DIRECTORY` requires a directory. `mode` arrives already masked
    /// by the process umask.
    pub fn open(path: &str, flags: OpenFlags, mode: Mode) -> KernelResult<Arc<dyn FileOps>> {
        let path = Registry::normalize(path);
        let mut reg = REGISTRY.lock();
        match reg.nodes.get(&path) {
            Some(Node::File(file)) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(KernelError::AlreadyExists);
                }
                if flags.contains(OpenFlags::DIRECTORY) {
                    return Err(KernelError::NotDirectory);
                }
                if flags.contains(OpenFlags::TRUNC) && !file.read_only {
                    file.truncate();
                }
                Ok(file.clone())
            }
            Some(Node::Dir) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(KernelError::AlreadyExists);
                }
                Ok(Arc::new(RamDir { path }))
            }
            None => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(KernelError::NoEntry);
                }
                if flags.contains(OpenFlags::DIRECTORY) {
                    return Err(KernelError::NoEntry);
                }
                if !reg.parent_exists(&path) {
                    return Err(KernelError::NoEntry);
                }
                let file = RamFile::new(mode);
                reg.nodes.insert(path, Node::File(file.clone()));
                Ok(file)
            }
        }
    }

    /// Look up a file node for exec/mmap backing.
    pub fn lookup_file(path: &str) -> KernelResult<Arc<RamFile>> {
        let path = Registry::normalize(path);
        match REGISTRY.lock().nodes.get(&path) {
            Some(Node::File(file)) => Ok(file.clone()),
            Some(Node::Dir) => Err(KernelError::IsDirectory),
            None => Err(KernelError::NoEntry),
        }
    }

    /// Move a node to a new path, replacing any existing file there.
    pub fn rename(old: &str, new: &str) -> KernelResult<()> {
        let old = Registry::normalize(old);
        let new = Registry::normalize(new);
        let mut reg = REGISTRY.lock();
        if !reg.nodes.contains_key(&old) {
            return Err(KernelError::NoEntry);
        }
        if !reg.parent_exists(&new) {
            return Err(KernelError::NoEntry);
        }
        if matches!(reg.nodes.get(&new), Some(Node::Dir)) {
            return Err(KernelError::IsDirectory);
        }
        let node = reg.nodes.remove(&old).unwrap();
        reg.nodes.insert(new, node);
        Ok(())
    }

    /// Remove a node. Directories must be empty.
    pub fn unlink(path: &str) -> KernelResult<()> {
        let path = Registry::normalize(path);
        let mut reg = REGISTRY.lock();
        match reg.nodes.get(&path) {
            Some(Node::Dir) => {
                if !reg.list(&path).is_empty() {
                    return Err(KernelError::Busy);
                }
            }
            Some(Node::File(_)) => {}
            None => return Err(KernelError::NoEntry),
        }
        reg.nodes.remove(&path);
        Ok(())
    }
}
