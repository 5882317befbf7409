//! File-descriptor system calls
//!
//! The core forwards everything to the file's per-object ops; only
//! descriptor-table bookkeeping and the `openat` contract live here.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    fs::{
        fd::{fd_flags_from_open, FdFlags},
        ramfs::{Mode, RamFs},
        OpenFile, OpenFlags, Pipe,
    },
    mm::user,
};

use super::{proc::resolve_path, SyscallCtx};

/// AT_FDCWD sentinel.
const AT_FDCWD: usize = usize::MAX - 99;

/// Cap on a single readv/writev transfer.
const IOV_MAX: usize = 64;

/// `openat(dirfd, path, flags, mode)`. Mode bits are masked by the
/// process umask before the node is created.
pub fn sys_openat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let flags = OpenFlags::from_bits_truncate(ctx.args[2] as u32);
    let mode = Mode(ctx.args[3] as u32 & 0o777 & !ctx.proc_.umask());
    if ctx.args[0] != AT_FDCWD && !path.starts_with('/') {
        // Directory-relative opens resolve through the dirfd's node;
        // only the cwd form is supported here.
        return Err(KernelError::NotSupported);
    }
    let path = resolve_path(ctx, &path);
    let ops = RamFs::open(&path, flags, mode)?;
    let file = OpenFile::new(ops, flags);
    let fd = ctx
        .proc_
        .fds
        .write()
        .alloc(file, fd_flags_from_open(flags))?;
    Ok(fd)
}

pub fn sys_close(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_.fds.write().close(ctx.args[0])?;
    Ok(0)
}

/// One iovec: `(base, len)`.
fn read_iovec(ctx: &SyscallCtx, ptr: u64, count: usize) -> KernelResult<Vec<(u64, usize)>> {
    if count > IOV_MAX {
        return Err(KernelError::Invalid);
    }
    let space = ctx.space();
    let mut iov = Vec::with_capacity(count);
    for i in 0..count {
        let mut raw = [0u8; 16];
        user::copyin(&space, ptr + (i * 16) as u64, &mut raw)?;
        let base = u64::from_le_bytes(raw[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(raw[8..16].try_into().unwrap()) as usize;
        iov.push((base, len));
    }
    Ok(iov)
}

/// `readv(fd, iov, iovcnt)`.
pub fn sys_readv(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let file = ctx.proc_.fds.read().get(ctx.args[0])?;
    let iov = read_iovec(ctx, ctx.args[1] as u64, ctx.args[2])?;
    let space = ctx.space();
    let mut total = 0usize;
    for (base, len) in iov {
        if len == 0 {
            continue;
        }
        let mut buf = Vec::new();
        buf.resize(len, 0u8);
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(KernelError::WouldBlock) if total > 0 => break,
            Err(e) => {
                if total > 0 {
                    break;
                }
                return Err(e);
            }
        };
        user::copyout(&space, base, &buf[..n])?;
        total += n;
        if n < len {
            break;
        }
    }
    Ok(total)
}

/// `writev(fd, iov, iovcnt)`.
pub fn sys_writev(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let file = ctx.proc_.fds.read().get(ctx.args[0])?;
    let iov = read_iovec(ctx, ctx.args[1] as u64, ctx.args[2])?;
    let space = ctx.space();
    let mut total = 0usize;
    for (base, len) in iov {
        if len == 0 {
            continue;
        }
        let mut buf = Vec::new();
        buf.resize(len, 0u8);
        user::copyin(&space, base, &mut buf)?;
        let n = match file.write(&buf) {
            Ok(n) => n,
            Err(KernelError::BrokenPipe) => {
                // EPIPE pairs with SIGPIPE.
                ctx.thread.post_signal(crate::process::signal::SIGPIPE);
                return Err(KernelError::BrokenPipe);
            }
            Err(e) => {
                if total > 0 {
                    break;
                }
                return Err(e);
            }
        };
        total += n;
        if n < len {
            break;
        }
    }
    Ok(total)
}

pub fn sys_lseek(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let file = ctx.proc_.fds.read().get(ctx.args[0])?;
    let pos = file.seek(ctx.args[1] as i64, ctx.args[2] as u32)?;
    Ok(pos as usize)
}

pub fn sys_dup(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_.fds.write().dup(ctx.args[0])
}

pub fn sys_dup3(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let flags = if ctx.args[2] as u32 & OpenFlags::CLOEXEC.bits() != 0 {
        FdFlags::CLOEXEC
    } else {
        FdFlags::empty()
    };
    ctx.proc_.fds.write().dup3(ctx.args[0], ctx.args[1], flags)
}

// fcntl commands.
const F_DUPFD: usize = 0;
const F_GETFD: usize = 1;
const F_SETFD: usize = 2;
const F_GETFL: usize = 3;
const F_SETFL: usize = 4;

pub fn sys_fcntl(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let fd = ctx.args[0];
    match ctx.args[1] {
        F_DUPFD => ctx.proc_.fds.write().dup(fd),
        F_GETFD => Ok(ctx.proc_.fds.read().fd_flags(fd)?.bits() as usize),
        F_SETFD => {
            let flags = FdFlags::from_bits_truncate(ctx.args[2] as u32);
            ctx.proc_.fds.write().set_fd_flags(fd, flags)?;
            Ok(0)
        }
        F_GETFL => {
            let file = ctx.proc_.fds.read().get(fd)?;
            let flags = *file.flags.lock();
            Ok(flags.bits() as usize)
        }
        F_SETFL => {
            let file = ctx.proc_.fds.read().get(fd)?;
            // Only the status subset is mutable.
            let settable = OpenFlags::APPEND | OpenFlags::NONBLOCK;
            let mut flags = file.flags.lock();
            *flags = (*flags - settable)
                | (OpenFlags::from_bits_truncate(ctx.args[2] as u32) & settable);
            Ok(0)
        }
        _ => Err(KernelError::Invalid),
    }
}

/// `ioctl` forwards to the object's op.
pub fn sys_ioctl(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let file = ctx.proc_.fds.read().get(ctx.args[0])?;
    file.ops.ioctl(ctx.args[1] as u32, ctx.args[2])
}

/// `getdents(fd, buf, len)`: fills records of
/// `(u64 pos, u16 reclen, u8 is_dir, name, NUL)`.
pub fn sys_getdents(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let file = ctx.proc_.fds.read().get(ctx.args[0])?;
    if !file.ops.is_dir() {
        return Err(KernelError::NotDirectory);
    }
    let space = ctx.space();
    let out_ptr = ctx.args[1] as u64;
    let cap = ctx.args[2];
    let mut written = 0usize;
    let mut pos = file.offset() as usize;
    while let Some((name, is_dir)) = file.ops.readdir(pos) {
        let reclen = 8 + 2 + 1 + name.len() + 1;
        if written + reclen > cap {
            break;
        }
        let mut rec = Vec::with_capacity(reclen);
        rec.extend_from_slice(&(pos as u64).to_le_bytes());
        rec.extend_from_slice(&(reclen as u16).to_le_bytes());
        rec.push(is_dir as u8);
        rec.extend_from_slice(name.as_bytes());
        rec.push(0);
        user::copyout(&space, out_ptr + written as u64, &rec)?;
        written += reclen;
        pos += 1;
    }
    // The directory offset tracks the enumeration cursor.
    file.seek(pos as i64, 0)?;
    Ok(written)
}

/// `pipe2(fds, flags)`.
pub fn sys_pipe2(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let flags = OpenFlags::from_bits_truncate(ctx.args[1] as u32);
    if !(flags - (OpenFlags::CLOEXEC | OpenFlags::NONBLOCK)).is_empty() {
        return Err(KernelError::Invalid);
    }
    let (reader, writer) = Pipe::new();
    let fd_flags = fd_flags_from_open(flags);
    let reader: Arc<dyn crate::fs::FileOps> = reader;
    let writer: Arc<dyn crate::fs::FileOps> = writer;
    let (rfd, wfd) = {
        let mut fds = ctx.proc_.fds.write();
        let rfd = fds.alloc(OpenFile::new(reader, flags), fd_flags)?;
        let wfd = match fds.alloc(OpenFile::new(writer, flags), fd_flags) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = fds.close(rfd);
                return Err(e);
            }
        };
        (rfd, wfd)
    };
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(rfd as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(wfd as u32).to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[0] as u64, &out)?;
    Ok(0)
}

pub fn sys_chdir(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[0] as u64)?;
    let path = resolve_path(ctx, &path);
    let node = RamFs::open(&path, OpenFlags::DIRECTORY, Mode(0))?;
    if !node.is_dir() {
        return Err(KernelError::NotDirectory);
    }
    *ctx.proc_.cwd.lock() = path;
    Ok(0)
}

pub fn sys_fchdir(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let file = ctx.proc_.fds.read().get(ctx.args[0])?;
    if !file.ops.is_dir() {
        return Err(KernelError::NotDirectory);
    }
    // The registry has no fd-to-path mapping; only path-based chdir
    // updates the cwd string.
    Err(KernelError::NotSupported)
}

pub fn sys_chroot(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    let path = user::copystr(&ctx.space(), ctx.args[0] as u64)?;
    let path = resolve_path(ctx, &path);
    RamFs::open(&path, OpenFlags::DIRECTORY, Mode(0))?;
    *ctx.proc_.root.lock() = path;
    Ok(0)
}

pub fn sys_unlinkat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let path = resolve_path(ctx, &path);
    RamFs::unlink(&path)?;
    Ok(0)
}

pub fn sys_mknodat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let mode = Mode(ctx.args[2] as u32 & 0o777 & !ctx.proc_.umask());
    let path = resolve_path(ctx, &path);
    RamFs::open(&path, OpenFlags::CREAT | OpenFlags::EXCL, mode)?;
    Ok(0)
}

pub fn sys_faccessat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let path = resolve_path(ctx, &path);
    RamFs::open(&path, OpenFlags::RDONLY, Mode(0))?;
    Ok(0)
}

/// `fstatat`: `(u64 size, u8 is_dir)` wire record.
pub fn sys_fstatat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let path = resolve_path(ctx, &path);
    let node = RamFs::open(&path, OpenFlags::RDONLY, Mode(0))?;
    let mut out = [0u8; 9];
    out[0..8].copy_from_slice(&node.size().to_le_bytes());
    out[8] = node.is_dir() as u8;
    user::copyout(&ctx.space(), ctx.args[2] as u64, &out)?;
    Ok(0)
}

pub fn sys_linkat(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    // The registry keeps one name per node.
    Err(KernelError::NotSupported)
}

pub fn sys_symlinkat(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Err(KernelError::NotSupported)
}

pub fn sys_readlinkat(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Err(KernelError::Invalid)
}

pub fn sys_renameat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let old = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let new = user::copystr(&ctx.space(), ctx.args[3] as u64)?;
    let old = resolve_path(ctx, &old);
    let new = resolve_path(ctx, &new);
    RamFs::rename(&old, &new)?;
    Ok(0)
}

pub fn sys_ftruncateat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    let path = resolve_path(ctx, &path);
    let file = RamFs::lookup_file(&path)?;
    file.truncate_to(ctx.args[2])?;
    Ok(0)
}

pub fn sys_fchmodat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    RamFs::lookup_file(&resolve_path(ctx, &path))?;
    // Permission bits are advisory in the registry.
    Ok(0)
}

pub fn sys_fchownat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    RamFs::lookup_file(&resolve_path(ctx, &path))?;
    Ok(0)
}

pub fn sys_utimensat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let path = user::copystr(&ctx.space(), ctx.args[1] as u64)?;
    RamFs::lookup_file(&resolve_path(ctx, &path))?;
    Ok(0)
}

pub fn sys_fsync(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_.fds.read().get(ctx.args[0])?;
    Ok(0)
}

pub fn sys_fdatasync(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_.fds.read().get(ctx.args[0])?;
    Ok(0)
}

/// `fstatvfsat`: `(u64 block_size, u64 blocks)` wire record.
pub fn sys_fstatvfsat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&(crate::mm::PAGE_SIZE as u64).to_le_bytes());
    let free = crate::mm::FRAME_ALLOCATOR.lock().free_frames();
    out[8..16].copy_from_slice(&free.to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[2] as u64, &out)?;
    Ok(0)
}

pub fn sys_mount(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    Err(KernelError::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcntl_constants_are_distinct() {
        let cmds = [F_DUPFD, F_GETFD, F_SETFD, F_GETFL, F_SETFL];
        for (i, a) in cmds.iter().enumerate() {
            for b in &cmds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
