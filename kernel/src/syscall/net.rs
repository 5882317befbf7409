//! Socket system calls
//!
//! The core carries the socket call numbers and forwards message I/O to
//! the file's per-object ops, but ships no protocol families; `socket`
//! reports EAFNOSUPPORT and the connection-oriented calls reflect the
//! object's actual capabilities.

use crate::error::{KernelError, KernelResult};

use super::SyscallCtx;

pub fn sys_socket(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Err(KernelError::AddressFamilyNotSupported)
}

pub fn sys_socketpair(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Err(KernelError::AddressFamilyNotSupported)
}

fn not_a_socket(ctx: &SyscallCtx) -> KernelResult<usize> {
    // Valid descriptor or not decides between ENOTCONN and EBADF.
    ctx.proc_.fds.read().get(ctx.args[0])?;
    Err(KernelError::NotConnected)
}

pub fn sys_bind(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_connect(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_listen(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_accept(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_getsockname(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_getpeername(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_getsockopt(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_setsockopt(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_sendmsg(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_recvmsg(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}

pub fn sys_shutdown(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    not_a_socket(ctx)
}
