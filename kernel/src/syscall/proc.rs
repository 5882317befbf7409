//! Process system calls

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::{
    error::{KernelError, KernelResult},
    mm::user,
    process::{
        self, clone,
        clone::CloneFlags,
        exec, exit, group,
        ptrace::{PtraceRequest, PtraceState},
        table, wait,
    },
};

use super::SyscallCtx;

/// x86 TF bit, used to arm single-stepping in a tracee's saved frame.
#[cfg(target_arch = "x86_64")]
const RFLAGS_TF: u64 = 1 << 8;

pub fn sys_exit(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let code = ctx.args[0] as i32;
    exit::exit_thread(ctx.proc_, ctx.thread.tid, wait::exit_status(code));
    Ok(0)
}

/// Exit every thread of the process.
pub fn sys_exit_group(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let code = ctx.args[0] as i32;
    let others: Vec<u64> = ctx
        .proc_
        .threads
        .lock()
        .iter()
        .copied()
        .filter(|&t| t != ctx.thread.tid)
        .collect();
    for tid in others {
        exit::terminate_thread(tid);
    }
    exit::exit_thread(ctx.proc_, ctx.thread.tid, wait::exit_status(code));
    Ok(0)
}

/// `clone(flags)`: the child starts paused with the creator's registers
/// and a zero return value, then is released to the scheduler. With
/// CLONE_VFORK the caller blocks until the child execs or exits.
pub fn sys_clone(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let flags = CloneFlags::from_bits(ctx.args[0] as u32).ok_or(KernelError::Invalid)?;
    // The child inherits the register state as of this call.
    *ctx.thread.trapframe.lock() = *ctx.tf;
    let child = clone::clone_thread(ctx.proc_, ctx.thread, flags)?;
    clone::release(child)?;

    if flags.contains(CloneFlags::VFORK) {
        // Rendezvous: sleep on the child's vfork queue until it execs or
        // exits, re-checking after every wake.
        while clone::vfork_pending(child) {
            if let Some(child_proc) = table::get_process(child) {
                child_proc.vfork_q.register(ctx.thread.tid);
                crate::sched::yield_cpu();
                child_proc.vfork_q.remove(ctx.thread.tid);
            } else {
                break;
            }
        }
    }
    Ok(child as usize)
}

/// `execveat(dirfd, path, argv, envp, flags)`.
pub fn sys_execveat(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let space = ctx.space();
    let path = user::copystr(&space, ctx.args[1] as u64)?;
    let argv = if ctx.args[2] != 0 {
        user::verifystra(&space, ctx.args[2] as u64)?
    } else {
        Vec::new()
    };
    let envp = if ctx.args[3] != 0 {
        user::verifystra(&space, ctx.args[3] as u64)?
    } else {
        Vec::new()
    };
    let path = resolve_path(ctx, &path);
    exec::execve(ctx.proc_, ctx.thread, &path, argv, envp)?;
    // The new image resumes at its entry point.
    *ctx.tf = *ctx.thread.trapframe.lock();
    Ok(0)
}

/// `wait4(pid, wstatus, options, rusage)`.
pub fn sys_wait4(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let raw_pid = ctx.args[0] as i64;
    let status_ptr = ctx.args[1] as u64;
    let options = ctx.args[2] as u32;
    let rusage_ptr = ctx.args[3] as u64;

    let (pid, status, usage) = wait::wait4(ctx.proc_, raw_pid, options)?;
    let space = ctx.space();
    if status_ptr != 0 {
        user::copyout(&space, status_ptr, &status.to_le_bytes())?;
    }
    if rusage_ptr != 0 && pid != 0 {
        user::copyout(&space, rusage_ptr, &encode_rusage(&usage))?;
    }
    Ok(pid as usize)
}

/// Wire layout of struct rusage: utime/stime timevals then the fault and
/// rss counters.
fn encode_rusage(usage: &process::Rusage) -> [u8; 48] {
    let mut out = [0u8; 48];
    out[0..8].copy_from_slice(&(usage.user_ticks / crate::TICKS_PER_SEC).to_le_bytes());
    out[8..16]
        .copy_from_slice(&((usage.user_ticks % crate::TICKS_PER_SEC) * 10_000).to_le_bytes());
    out[16..24].copy_from_slice(&(usage.system_ticks / crate::TICKS_PER_SEC).to_le_bytes());
    out[24..32]
        .copy_from_slice(&((usage.system_ticks % crate::TICKS_PER_SEC) * 10_000).to_le_bytes());
    out[32..40].copy_from_slice(&usage.page_faults.to_le_bytes());
    out[40..48].copy_from_slice(&usage.max_rss_pages.to_le_bytes());
    out
}

pub fn sys_getpid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.pid as usize)
}

pub fn sys_getppid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.parent_pid() as usize)
}

pub fn sys_gettid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.thread.tid as usize)
}

pub fn sys_sched_yield(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    crate::sched::yield_cpu();
    Ok(0)
}

/// `nanosleep(req, rem)`: suspend until the timeout elapses, EINTR on an
/// unmasked signal.
pub fn sys_nanosleep(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let space = ctx.space();
    let mut raw = [0u8; 16];
    user::copyin(&space, ctx.args[0] as u64, &mut raw)?;
    let secs = i64::from_le_bytes(raw[0..8].try_into().unwrap());
    let nanos = i64::from_le_bytes(raw[8..16].try_into().unwrap());
    if secs < 0 || !(0..1_000_000_000).contains(&nanos) {
        return Err(KernelError::Invalid);
    }
    let deadline = crate::ticks() + (secs as u64) * crate::TICKS_PER_SEC + 1;
    while crate::ticks() < deadline {
        let pending = ctx.thread.pending.load(Ordering::SeqCst)
            | ctx.proc_.pending.load(Ordering::SeqCst);
        if process::signal::next_deliverable(pending, ctx.thread.sigmask()).is_some() {
            return Err(KernelError::Interrupted);
        }
        crate::sched::yield_cpu();
        #[cfg(not(target_os = "none"))]
        break; // Host has no timer tick to advance.
    }
    Ok(0)
}

pub fn sys_kill(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    process::kill(ctx.proc_, ctx.args[0] as i64, ctx.args[1] as u8)?;
    Ok(0)
}

pub fn sys_gettls(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.thread.tls_base.load(Ordering::Acquire) as usize)
}

pub fn sys_settls(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.thread
        .tls_base
        .store(ctx.args[0] as u64, Ordering::Release);
    Ok(0)
}

pub fn sys_setpgid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let pid = if ctx.args[0] == 0 {
        ctx.proc_.pid
    } else {
        ctx.args[0] as u64
    };
    group::setpgid(pid, ctx.args[1] as u64)?;
    Ok(0)
}

pub fn sys_getpgid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let pid = if ctx.args[0] == 0 {
        ctx.proc_.pid
    } else {
        ctx.args[0] as u64
    };
    let target = table::get_process(pid).ok_or(KernelError::NoProcess)?;
    Ok(target.pgid.load(Ordering::Acquire) as usize)
}

pub fn sys_getpgrp(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.pgid.load(Ordering::Acquire) as usize)
}

pub fn sys_setsid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    group::setsid(ctx.proc_.pid).map(|sid| sid as usize)
}

pub fn sys_getsid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let pid = if ctx.args[0] == 0 {
        ctx.proc_.pid
    } else {
        ctx.args[0] as u64
    };
    let target = table::get_process(pid).ok_or(KernelError::NoProcess)?;
    Ok(target.sid.load(Ordering::Acquire) as usize)
}

pub fn sys_getuid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.creds.lock().uid as usize)
}

pub fn sys_geteuid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.creds.lock().euid as usize)
}

pub fn sys_getgid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.creds.lock().gid as usize)
}

pub fn sys_getegid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.creds.lock().egid as usize)
}

pub fn sys_setuid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_.creds.lock().setuid(ctx.args[0] as u32)?;
    Ok(0)
}

pub fn sys_setgid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_.creds.lock().setgid(ctx.args[0] as u32)?;
    Ok(0)
}

pub fn sys_setreuid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_
        .creds
        .lock()
        .setreuid(ctx.args[0] as u32, ctx.args[1] as u32)?;
    Ok(0)
}

pub fn sys_setregid(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    ctx.proc_
        .creds
        .lock()
        .setregid(ctx.args[0] as u32, ctx.args[1] as u32)?;
    Ok(0)
}

pub fn sys_getgroups(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let cap = ctx.args[0];
    let out_ptr = ctx.args[1] as u64;
    let groups = ctx.proc_.creds.lock().groups.clone();
    if cap == 0 {
        return Ok(groups.len());
    }
    if cap < groups.len() {
        return Err(KernelError::Invalid);
    }
    let mut bytes = Vec::with_capacity(groups.len() * 4);
    for g in &groups {
        bytes.extend_from_slice(&g.to_le_bytes());
    }
    user::copyout(&ctx.space(), out_ptr, &bytes)?;
    Ok(groups.len())
}

pub fn sys_setgroups(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let count = ctx.args[0];
    if count > crate::process::cred::NGROUPS_MAX {
        return Err(KernelError::Invalid);
    }
    let mut raw = Vec::new();
    raw.resize(count * 4, 0u8);
    user::copyin(&ctx.space(), ctx.args[1] as u64, &mut raw)?;
    let groups: Vec<u32> = raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    ctx.proc_.creds.lock().setgroups(&groups)?;
    Ok(0)
}

/// `ptrace(request, pid, addr, data)`.
pub fn sys_ptrace(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let request = PtraceRequest::from_raw(ctx.args[0])?;
    match request {
        PtraceRequest::TraceMe => {
            let mut pt = ctx.thread.ptrace.lock();
            if pt.is_traced() {
                return Err(KernelError::NotPermitted);
            }
            pt.state = PtraceState::Running;
            pt.tracer = ctx.proc_.parent_pid();
            Ok(0)
        }
        PtraceRequest::Attach => {
            let target_pid = ctx.args[1] as u64;
            let target = table::get_process(target_pid).ok_or(KernelError::NoProcess)?;
            process::check_kill_permission(ctx.proc_, &target)?;
            let tid = *target.threads.lock().first().ok_or(KernelError::NoProcess)?;
            let thread = table::get_thread(tid).ok_or(KernelError::NoProcess)?;
            let mut pt = thread.ptrace.lock();
            if pt.is_traced() {
                return Err(KernelError::NotPermitted);
            }
            pt.tracer = ctx.proc_.pid;
            pt.stop(process::signal::SIGSTOP);
            drop(pt);
            process::deliver_to_process(&target, process::signal::SIGSTOP);
            Ok(0)
        }
        PtraceRequest::Detach => {
            let (_target, thread) = tracee(ctx, ctx.args[1] as u64)?;
            let mut pt = thread.ptrace.lock();
            *pt = Default::default();
            drop(pt);
            resume_tracee(&thread);
            Ok(0)
        }
        PtraceRequest::Cont | PtraceRequest::Syscall | PtraceRequest::SingleStep => {
            let (_target, thread) = tracee(ctx, ctx.args[1] as u64)?;
            thread.ptrace.lock().resume(request)?;
            #[cfg(target_arch = "x86_64")]
            {
                // Arm or clear the trap flag in the saved user frame.
                let mut tf = thread.trapframe.lock();
                if request == PtraceRequest::SingleStep {
                    tf.rflags |= RFLAGS_TF;
                } else {
                    tf.rflags &= !RFLAGS_TF;
                }
            }
            resume_tracee(&thread);
            Ok(0)
        }
        PtraceRequest::PeekData => {
            let (target, _) = tracee(ctx, ctx.args[1] as u64)?;
            let space = target.space.lock().clone();
            let mut word = [0u8; 8];
            user::copyin(&space, ctx.args[2] as u64, &mut word)?;
            Ok(u64::from_le_bytes(word) as usize)
        }
        PtraceRequest::PokeData => {
            let (target, _) = tracee(ctx, ctx.args[1] as u64)?;
            let space = target.space.lock().clone();
            user::copyout(&space, ctx.args[2] as u64, &(ctx.args[3] as u64).to_le_bytes())?;
            Ok(0)
        }
        PtraceRequest::GetRegs => {
            let (_, thread) = tracee(ctx, ctx.args[1] as u64)?;
            let tf = *thread.trapframe.lock();
            // SAFETY: Trapframe is repr(C) plain data.
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    &tf as *const _ as *const u8,
                    core::mem::size_of_val(&tf),
                )
            };
            user::copyout(&ctx.space(), ctx.args[3] as u64, bytes)?;
            Ok(0)
        }
    }
}

/// Resolve a stopped tracee of the caller.
fn tracee(
    ctx: &SyscallCtx,
    pid: u64,
) -> KernelResult<(
    alloc::sync::Arc<process::Process>,
    alloc::sync::Arc<process::Thread>,
)> {
    let target = table::get_process(pid).ok_or(KernelError::NoProcess)?;
    let tid = *target.threads.lock().first().ok_or(KernelError::NoProcess)?;
    let thread = table::get_thread(tid).ok_or(KernelError::NoProcess)?;
    if thread.ptrace.lock().tracer != ctx.proc_.pid {
        return Err(KernelError::NoProcess);
    }
    Ok((target, thread))
}

fn resume_tracee(thread: &alloc::sync::Arc<process::Thread>) {
    if thread.state() == process::ThreadState::Stopped {
        thread.set_state(process::ThreadState::Ready);
        crate::sched::enqueue(thread.tid, thread.priority());
    }
}

/// Relative paths resolve against the caller's working directory.
pub fn resolve_path(ctx: &SyscallCtx, path: &str) -> alloc::string::String {
    if path.starts_with('/') {
        alloc::string::String::from(path)
    } else {
        let mut full = ctx.proc_.cwd.lock().clone();
        if !full.ends_with('/') {
            full.push('/');
        }
        full.push_str(path);
        full
    }
}
