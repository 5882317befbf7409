//! Process & thread model
//!
//! Processes own threads, an address space, a descriptor table, and the
//! signal-action table; threads own their kernel stack and trapframe.
//! Parent/child and group/session relations are weak PID edges resolved
//! through [`table`] under its lock, so the object graph stays acyclic.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{string::String, sync::Arc};
use core::sync::atomic::Ordering;

pub mod clone;
pub mod cred;
pub mod exec;
pub mod exit;
pub mod group;
pub mod process;
pub mod ptrace;
pub mod signal;
pub mod table;
pub mod thread;
pub mod wait;

pub use process::{ProcState, Process, Rusage};
pub use table::{current_process, current_thread};
pub use thread::{Thread, ThreadState};

use crate::error::{KernelError, KernelResult};
use crate::mm::AddressSpace;

/// Process identifier.
pub type Pid = u64;
/// Thread identifier; a thread-group leader's TID equals its PID.
pub type Tid = u64;

/// Route a signal to a process, honoring the job-control specials.
///
/// SIGSTOP stops every thread unconditionally; SIGCONT resumes them and
/// flags the continue for WCONTINUED reporting; everything else lands in
/// the pending set for the next kernel-to-user boundary.
pub fn deliver_to_process(proc_: &Arc<Process>, sig: u8) {
    match sig {
        signal::SIGSTOP => {
            proc_.stopped.store(true, Ordering::Release);
            proc_.continued.store(false, Ordering::Release);
            for &tid in proc_.threads.lock().iter() {
                if let Some(thread) = table::get_thread(tid) {
                    thread.set_state(ThreadState::Stopped);
                    crate::sched::this_cpu().dequeue(tid);
                }
            }
            if let Some(parent) = table::get_process(proc_.parent_pid()) {
                parent.wait_q.wake_all();
            }
        }
        signal::SIGCONT => {
            proc_.stopped.store(false, Ordering::Release);
            proc_.continued.store(true, Ordering::Release);
            proc_.post_signal(sig);
            for &tid in proc_.threads.lock().iter() {
                if let Some(thread) = table::get_thread(tid) {
                    if thread.state() == ThreadState::Stopped {
                        thread.set_state(ThreadState::Ready);
                        crate::sched::enqueue(tid, thread.priority());
                    }
                }
            }
            if let Some(parent) = table::get_process(proc_.parent_pid()) {
                parent.wait_q.wake_all();
            }
        }
        _ => {
            proc_.post_signal(sig);
            // Kick a thread that can take it so blocked syscalls return
            // EINTR promptly.
            for &tid in proc_.threads.lock().iter() {
                if let Some(thread) = table::get_thread(tid) {
                    let deliverable = sig == signal::SIGKILL
                        || signal::next_deliverable(signal::sig_bit(sig), thread.sigmask())
                            .is_some();
                    if deliverable {
                        if thread.state() == ThreadState::Blocked {
                            thread.set_state(ThreadState::Ready);
                            crate::sched::enqueue(tid, thread.priority());
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Route a signal to one thread.
pub fn deliver_to_thread(thread: &Arc<Thread>, sig: u8) {
    thread.post_signal(sig);
    if thread.state() == ThreadState::Blocked {
        thread.set_state(ThreadState::Ready);
        crate::sched::enqueue(thread.tid, thread.priority());
    }
}

/// Permission check for kill: root, or matching real/effective uid.
pub fn check_kill_permission(caller: &Process, target: &Process) -> KernelResult<()> {
    let c = caller.creds.lock();
    let t = target.creds.lock();
    if c.euid == 0 || c.euid == t.uid || c.euid == t.suid || c.uid == t.uid || c.uid == t.suid {
        Ok(())
    } else {
        Err(KernelError::NotPermitted)
    }
}

/// The kill syscall's fan-out: pid > 0 one process, pid == 0 own group,
/// pid == -1 everyone except init, pid < -1 explicit group.
pub fn kill(caller: &Arc<Process>, raw_pid: i64, sig: u8) -> KernelResult<()> {
    if sig == 0 || sig as usize > signal::SIG_COUNT {
        return Err(KernelError::Invalid);
    }
    if raw_pid > 0 {
        let target = table::get_process(raw_pid as u64).ok_or(KernelError::NoProcess)?;
        check_kill_permission(caller, &target)?;
        deliver_to_process(&target, sig);
        Ok(())
    } else if raw_pid == 0 {
        let pgid = caller.pgid.load(Ordering::Acquire);
        group::signal_group(pgid, sig).map(|_| ())
    } else if raw_pid == -1 {
        let mut hit = 0;
        for pid in table::all_pids() {
            if pid == exit::INIT_PID || pid == caller.pid {
                continue;
            }
            if let Some(target) = table::get_process(pid) {
                if check_kill_permission(caller, &target).is_ok() {
                    deliver_to_process(&target, sig);
                    hit += 1;
                }
            }
        }
        if hit == 0 {
            return Err(KernelError::NoProcess);
        }
        Ok(())
    } else {
        group::signal_group((-raw_pid) as u64, sig).map(|_| ())
    }
}

/// Build the init skeleton (PID 1) with one thread, ready for the first
/// exec. Called once during bring-up.
pub fn create_init() -> KernelResult<Arc<Process>> {
    let space = Arc::new(AddressSpace::new()?);
    let init = Arc::new(Process::new(
        exit::INIT_PID,
        0,
        String::from("init"),
        space,
    ));
    let thread = Arc::new(Thread::new(
        exit::INIT_PID,
        exit::INIT_PID,
        crate::sched::DEFAULT_PRIORITY,
    ));
    init.threads.lock().push(exit::INIT_PID);
    group::join(exit::INIT_PID, exit::INIT_PID, exit::INIT_PID);
    table::insert_process(init.clone());
    table::insert_thread(thread);
    Ok(init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::space::test_support;

    fn spawn(uid: u32) -> Arc<Process> {
        let pid = table::alloc_id();
        let p = Arc::new(Process::new(
            pid,
            0,
            String::from("k"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        {
            let mut c = p.creds.lock();
            c.uid = uid;
            c.euid = uid;
            c.suid = uid;
        }
        table::insert_process(p.clone());
        p
    }

    #[test]
    fn sigstop_and_sigcont_toggle_job_state() {
        let _g = test_support::lock();
        let p = spawn(0);
        deliver_to_process(&p, signal::SIGSTOP);
        assert!(p.stopped.load(Ordering::Acquire));
        deliver_to_process(&p, signal::SIGCONT);
        assert!(!p.stopped.load(Ordering::Acquire));
        assert!(p.continued.load(Ordering::Acquire));
        table::remove_process(p.pid);
    }

    #[test]
    fn kill_permission_matrix() {
        let _g = test_support::lock();
        let root = spawn(0);
        let alice = spawn(1000);
        let bob = spawn(2000);
        assert!(check_kill_permission(&root, &alice).is_ok());
        assert!(check_kill_permission(&alice, &bob).is_err());
        assert!(check_kill_permission(&alice, &alice).is_ok());
        for p in [&root, &alice, &bob] {
            table::remove_process(p.pid);
        }
    }

    #[test]
    fn kill_specific_pid_posts_signal() {
        let _g = test_support::lock();
        let caller = spawn(0);
        let target = spawn(1000);
        kill(&caller, target.pid as i64, signal::SIGTERM).unwrap();
        assert_ne!(
            target.pending.load(Ordering::SeqCst) & signal::sig_bit(signal::SIGTERM),
            0
        );
        assert_eq!(
            kill(&caller, 0x7FFF_FFF0, signal::SIGTERM).err(),
            Some(KernelError::NoProcess)
        );
        table::remove_process(caller.pid);
        table::remove_process(target.pid);
    }
}
