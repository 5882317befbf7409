//! wait4
//!
//! Four target selectors (specific PID, any child, own group, explicit
//! group), the WNOHANG/WUNTRACED/WCONTINUED options, and zombie reaping
//! that folds the child's usage counters into the parent's cumulative
//! ones. The parent sleeps on its own wait queue; child exit and stop
//! paths wake it.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};

use super::{
    process::{ProcState, Process, Rusage},
    signal, table,
};

/// Options, POSIX encoding.
pub const WNOHANG: u32 = 1;
pub const WUNTRACED: u32 = 2;
pub const WCONTINUED: u32 = 8;

/// `(code & 0xFF) << 8`: normal exit.
pub const fn exit_status(code: i32) -> i32 {
    (code & 0xFF) << 8
}

/// `sig & 0x7F`: killed by a signal.
pub const fn signaled_status(sig: u8) -> i32 {
    (sig & 0x7F) as i32
}

/// `0x7F | sig << 8`: stopped (reported under WUNTRACED or ptrace).
pub const fn stopped_status(sig: u8) -> i32 {
    0x7F | ((sig as i32) << 8)
}

/// Continued after SIGCONT.
pub const CONTINUED_STATUS: i32 = 0xFFFF;

/// Which children a wait4 call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Pid(u64),
    AnyChild,
    OwnGroup,
    Group(u64),
}

impl WaitTarget {
    /// Decode the wait4 pid argument.
    pub fn from_raw(pid: i64) -> Self {
        if pid > 0 {
            Self::Pid(pid as u64)
        } else if pid == -1 {
            Self::AnyChild
        } else if pid == 0 {
            Self::OwnGroup
        } else {
            Self::Group((-pid) as u64)
        }
    }

    fn matches(&self, caller: &Process, child: &Process) -> bool {
        match *self {
            Self::Pid(pid) => child.pid == pid,
            Self::AnyChild => true,
            Self::OwnGroup => {
                child.pgid.load(Ordering::Acquire) == caller.pgid.load(Ordering::Acquire)
            }
            Self::Group(pgid) => child.pgid.load(Ordering::Acquire) == pgid,
        }
    }
}

/// One wait4 attempt without blocking.
///
/// `Ok(Some((pid, status, rusage)))` when a child was consumed;
/// `Ok(None)` when matching children exist but none is waitable yet.
pub fn try_wait(
    caller: &Arc<Process>,
    target: WaitTarget,
    options: u32,
) -> KernelResult<Option<(u64, i32, Rusage)>> {
    let children = table::find_children(caller.pid);

    let mut any_match = false;
    for child_pid in &children {
        let Some(child) = table::get_process(*child_pid) else {
            continue;
        };
        if !target.matches(caller, &child) {
            continue;
        }
        any_match = true;

        if child.state() == ProcState::Zombie {
            let status = child.exit_status.load(Ordering::Acquire);
            let mut usage = *child.rusage.lock();
            usage.accumulate(&child.child_rusage.lock());
            // The child's and its reaped descendants' usage both land in
            // the caller's cumulative counters.
            caller.child_rusage.lock().accumulate(&usage);
            super::exit::reap(&child);
            return Ok(Some((child.pid, status, usage)));
        }

        // Ptrace stops report through wait4 even without WUNTRACED. The
        // event is consumed so a repeated wait does not re-report it.
        let mut reported_stop = None;
        for &tid in child.threads.lock().iter() {
            if let Some(thread) = table::get_thread(tid) {
                let mut pt = thread.ptrace.lock();
                if pt.state == super::ptrace::PtraceState::Stopped
                    && pt.tracer == caller.pid
                    && pt.stop_signal != 0
                {
                    reported_stop = Some(pt.stop_signal);
                    pt.stop_signal = 0;
                    break;
                }
            }
        }
        if let Some(sig) = reported_stop {
            return Ok(Some((child.pid, stopped_status(sig), Rusage::default())));
        }

        if options & WUNTRACED != 0 && child.stopped.swap(false, Ordering::AcqRel) {
            return Ok(Some((
                child.pid,
                stopped_status(signal::SIGSTOP),
                Rusage::default(),
            )));
        }
        if options & WCONTINUED != 0 && child.continued.swap(false, Ordering::AcqRel) {
            return Ok(Some((child.pid, CONTINUED_STATUS, Rusage::default())));
        }
    }

    if !any_match {
        return Err(KernelError::NoChild);
    }
    Ok(None)
}

/// Full wait4: blocks on the caller's wait queue until a matching child
/// becomes waitable, unless WNOHANG.
pub fn wait4(
    caller: &Arc<Process>,
    raw_pid: i64,
    options: u32,
) -> KernelResult<(u64, i32, Rusage)> {
    let target = WaitTarget::from_raw(raw_pid);
    loop {
        if let Some(hit) = try_wait(caller, target, options)? {
            return Ok(hit);
        }
        if options & WNOHANG != 0 {
            // Nothing changed state yet.
            return Ok((0, 0, Rusage::default()));
        }

        // Sleep on our wait queue; child exit/stop paths wake it. The
        // predicate is re-checked after every wake-up.
        if let Some(tid) = crate::sched::current_tid() {
            caller.wait_q.register(tid);
            crate::sched::yield_cpu();
            caller.wait_q.remove(tid);
            // An unmasked pending signal interrupts the wait.
            if let Some(thread) = table::get_thread(tid) {
                let pending = thread.pending.load(Ordering::SeqCst)
                    | caller.pending.load(Ordering::SeqCst);
                if signal::next_deliverable(pending, thread.sigmask()).is_some() {
                    return Err(KernelError::Interrupted);
                }
            }
        } else {
            return Err(KernelError::WouldBlock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{space::test_support, AddressSpace};
    use alloc::string::String;

    fn spawn_family() -> (Arc<Process>, Arc<Process>) {
        let ppid = table::alloc_id();
        let parent = Arc::new(Process::new(
            ppid,
            0,
            String::from("p"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        table::insert_process(parent.clone());
        let cpid = table::alloc_id();
        let child = Arc::new(Process::new(
            cpid,
            ppid,
            String::from("c"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        parent.children.lock().push(cpid);
        table::insert_process(child.clone());
        (parent, child)
    }

    fn cleanup(parent: &Arc<Process>) {
        table::remove_process(parent.pid);
    }

    #[test]
    fn status_encodings() {
        assert_eq!(exit_status(42), 42 << 8);
        assert_eq!(signaled_status(11), 11);
        assert_eq!(stopped_status(19), 0x7F | (19 << 8));
        assert_eq!(CONTINUED_STATUS, 0xFFFF);
    }

    #[test]
    fn target_decoding() {
        assert_eq!(WaitTarget::from_raw(5), WaitTarget::Pid(5));
        assert_eq!(WaitTarget::from_raw(-1), WaitTarget::AnyChild);
        assert_eq!(WaitTarget::from_raw(0), WaitTarget::OwnGroup);
        assert_eq!(WaitTarget::from_raw(-7), WaitTarget::Group(7));
    }

    #[test]
    fn no_children_is_echild() {
        let _g = test_support::lock();
        let pid = table::alloc_id();
        let lonely = Arc::new(Process::new(
            pid,
            0,
            String::from("l"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        table::insert_process(lonely.clone());
        assert_eq!(
            try_wait(&lonely, WaitTarget::AnyChild, 0).err(),
            Some(KernelError::NoChild)
        );
        cleanup(&lonely);
    }

    #[test]
    fn zombie_is_reaped_and_pid_disappears() {
        let _g = test_support::lock();
        let (parent, child) = spawn_family();
        let child_pid = child.pid;
        child.rusage.lock().user_ticks = 11;
        super::super::exit::exit_process(&child, exit_status(3));

        let (pid, status, usage) = try_wait(&parent, WaitTarget::AnyChild, 0)
            .unwrap()
            .unwrap();
        assert_eq!(pid, child_pid);
        assert_eq!(status, exit_status(3));
        assert_eq!(usage.user_ticks, 11);
        // Reaped: the PID is gone and the usage landed in the parent.
        assert!(!table::pid_exists(child_pid));
        assert_eq!(parent.child_rusage.lock().user_ticks, 11);
        // A second wait finds nothing.
        assert_eq!(
            try_wait(&parent, WaitTarget::AnyChild, 0).err(),
            Some(KernelError::NoChild)
        );
        cleanup(&parent);
    }

    #[test]
    fn specific_pid_selector() {
        let _g = test_support::lock();
        let (parent, child) = spawn_family();
        super::super::exit::exit_process(&child, exit_status(0));
        // Waiting for a different pid reports ECHILD.
        assert_eq!(
            try_wait(&parent, WaitTarget::Pid(child.pid + 999), 0).err(),
            Some(KernelError::NoChild)
        );
        // The right pid reaps.
        assert!(try_wait(&parent, WaitTarget::Pid(child.pid), 0)
            .unwrap()
            .is_some());
        cleanup(&parent);
    }

    #[test]
    fn wnohang_returns_zero_when_running() {
        let _g = test_support::lock();
        let (parent, child) = spawn_family();
        let (pid, status, _) = wait4(&parent, -1, WNOHANG).unwrap();
        assert_eq!((pid, status), (0, 0));
        super::super::exit::exit_process(&child, exit_status(1));
        super::super::exit::reap(&child);
        cleanup(&parent);
    }

    #[test]
    fn wuntraced_reports_stopped_child_once() {
        let _g = test_support::lock();
        let (parent, child) = spawn_family();
        child.stopped.store(true, Ordering::Release);
        // Without WUNTRACED the stop is invisible.
        assert!(try_wait(&parent, WaitTarget::AnyChild, 0).unwrap().is_none());
        let (pid, status, _) = try_wait(&parent, WaitTarget::AnyChild, WUNTRACED)
            .unwrap()
            .unwrap();
        assert_eq!(pid, child.pid);
        assert_eq!(status, stopped_status(signal::SIGSTOP));
        // Consumed.
        assert!(try_wait(&parent, WaitTarget::AnyChild, WUNTRACED)
            .unwrap()
            .is_none());
        super::super::exit::exit_process(&child, 0);
        super::super::exit::reap(&child);
        cleanup(&parent);
    }

    #[test]
    fn group_selectors_filter_members() {
        let _g = test_support::lock();
        let (parent, child) = spawn_family();
        child.pgid.store(4242, Ordering::Release);
        super::super::exit::exit_process(&child, exit_status(9));
        // Wrong group: no match at all.
        assert_eq!(
            try_wait(&parent, WaitTarget::Group(999_999), 0).err(),
            Some(KernelError::NoChild)
        );
        // Right group reaps.
        let (pid, _, _) = try_wait(&parent, WaitTarget::Group(4242), 0)
            .unwrap()
            .unwrap();
        assert_eq!(pid, child.pid);
        cleanup(&parent);
    }
}
