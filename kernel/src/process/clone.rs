//! Thread and process creation
//!
//! `clone` is the single primitive: plain fork is `clone` with no flags,
//! a kernel-visible thread is `CLONE_VM | CLONE_THREAD`, and vfork is
//! `CLONE_VM | CLONE_VFORK`. New threads start paused with a copy of the
//! creator's register set and a zeroed syscall-return register; the
//! creator releases them to the scheduler.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};

use super::{
    group,
    process::Process,
    table,
    thread::{Thread, ThreadState},
    Pid, Tid,
};

bitflags::bitflags! {
    /// Clone behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        /// Share the address space.
        const VM     = 1 << 8;
        /// Share the process (thread group). Requires VM, forbids VFORK.
        const THREAD = 1 << 16;
        /// Block the creator until the child execs or exits.
        const VFORK  = 1 << 14;
    }
}

impl CloneFlags {
    /// Reject the combinations the contract forbids.
    pub fn validate(self) -> KernelResult<()> {
        if self.contains(Self::THREAD) && !self.contains(Self::VM) {
            return Err(KernelError::Invalid);
        }
        if self.contains(Self::THREAD) && self.contains(Self::VFORK) {
            return Err(KernelError::Invalid);
        }
        Ok(())
    }
}

/// Create a new thread (and, without `CLONE_THREAD`, its new process).
///
/// Returns the child's TID (== PID for a fresh process). The child is
/// left in [`ThreadState::Paused`]; call [`release`] to let it run.
pub fn clone_thread(
    parent_proc: &Arc<Process>,
    parent_thread: &Arc<Thread>,
    flags: CloneFlags,
) -> KernelResult<Tid> {
    flags.validate()?;
    let id = table::alloc_id();

    let (child_proc, child_pid): (Arc<Process>, Pid) = if flags.contains(CloneFlags::THREAD) {
        (parent_proc.clone(), parent_proc.pid)
    } else {
        let space = if flags.contains(CloneFlags::VM) {
            parent_proc.space.lock().clone()
        } else {
            Arc::new(parent_proc.space.lock().fork()?)
        };
        let child = Arc::new(Process::new(
            id,
            parent_proc.pid,
            parent_proc.name.lock().clone(),
            space,
        ));
        // Inherit the resource container pieces fork copies.
        *child.fds.write() = parent_proc.fds.read().clone_for_fork();
        *child.creds.lock() = parent_proc.creds.lock().clone();
        *child.actions.lock() = {
            let src = parent_proc.actions.lock();
            let mut copy = super::signal::ActionTable::new();
            for sig in 1..=super::signal::SIG_COUNT as u8 {
                if sig != super::signal::SIGKILL && sig != super::signal::SIGSTOP {
                    let _ = copy.set(sig, src.get(sig).unwrap());
                }
            }
            copy
        };
        *child.cwd.lock() = parent_proc.cwd.lock().clone();
        *child.root.lock() = parent_proc.root.lock().clone();
        child.set_umask(parent_proc.umask());

        // Job control membership is inherited.
        let pgid = parent_proc.pgid.load(Ordering::Acquire);
        let sid = parent_proc.sid.load(Ordering::Acquire);
        child.pgid.store(pgid, Ordering::Release);
        child.sid.store(sid, Ordering::Release);
        group::join(id, pgid, sid);

        if flags.contains(CloneFlags::VFORK) {
            child.vfork_active.store(true, Ordering::Release);
        }

        parent_proc.children.lock().push(id);
        table::insert_process(child.clone());
        (child, id)
    };

    let thread = Arc::new(Thread::new(id, child_pid, parent_thread.priority()));
    // Child inherits the creator's register set with the syscall-return
    // register zeroed, and the creator's signal mask.
    {
        let mut tf = thread.trapframe.lock();
        *tf = *parent_thread.trapframe.lock();
        tf.set_syscall_retval(0);
    }
    thread.set_sigmask(parent_thread.sigmask());
    thread
        .tls_base
        .store(parent_thread.tls_base.load(Ordering::Acquire), Ordering::Release);

    child_proc.threads.lock().push(id);
    table::insert_thread(thread);
    Ok(id)
}

/// Release a paused child to the scheduler.
pub fn release(tid: Tid) -> KernelResult<()> {
    let thread = table::get_thread(tid).ok_or(KernelError::NoProcess)?;
    if thread.state() != ThreadState::Paused {
        return Err(KernelError::Busy);
    }
    thread.set_state(ThreadState::Ready);
    crate::sched::enqueue(tid, thread.priority());
    Ok(())
}

/// Whether the parent must still block on the child's vfork rendezvous.
pub fn vfork_pending(child_pid: Pid) -> bool {
    table::get_process(child_pid)
        .map(|p| p.vfork_active.load(Ordering::Acquire))
        .unwrap_or(false)
}

/// Release the vfork rendezvous (child exec or exit path).
pub fn vfork_release(child: &Process) {
    if child.vfork_active.swap(false, Ordering::AcqRel) {
        child.vfork_q.wake_all();
    }
}
