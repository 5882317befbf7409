//! Process control block
//!
//! The resource container: address space, descriptor table, credentials,
//! signal actions, job-control membership, accumulated usage, and the
//! vfork rendezvous. Parent/child edges are weak PID references resolved
//! through the global table; the only strong ownership runs downward
//! (process owns threads, space, fd table).

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::{fs::FdTable, mm::AddressSpace, sched::WaitQueue};

use super::{cred::Credentials, signal::ActionTable, Pid, Tid};

/// Process lifecycle states.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running = 0,
    /// All threads exited; waiting for the parent to reap.
    Zombie = 1,
    /// Reaped; the PID is eligible for reuse.
    Dead = 2,
}

/// Accumulated resource usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rusage {
    pub user_ticks: u64,
    pub system_ticks: u64,
    pub page_faults: u64,
    pub max_rss_pages: u64,
}

impl Rusage {
    /// Fold another usage record into this one (child reaping).
    pub fn accumulate(&mut self, other: &Rusage) {
        self.user_ticks += other.user_ticks;
        self.system_ticks += other.system_ticks;
        self.page_faults += other.page_faults;
        self.max_rss_pages = self.max_rss_pages.max(other.max_rss_pages);
    }
}

/// The resource container.
pub struct Process {
    pub pid: Pid,
    /// Weak parent reference (0 = none); resolved under the process-list
    /// lock.
    parent: AtomicU64,
    state: AtomicU32,
    pub name: Mutex<String>,
    /// Address space; exec swaps the Arc.
    pub space: Mutex<Arc<AddressSpace>>,
    /// TIDs of this process's threads.
    pub threads: Mutex<Vec<Tid>>,
    /// PIDs of live children.
    pub children: Mutex<Vec<Pid>>,
    /// Descriptor table behind the per-process rwlock.
    pub fds: RwLock<FdTable>,
    pub creds: Mutex<Credentials>,
    pub actions: Mutex<ActionTable>,
    /// Process-directed pending signals.
    pub pending: AtomicU64,
    pub cwd: Mutex<String>,
    pub root: Mutex<String>,
    umask: AtomicU32,
    /// Job-control membership.
    pub pgid: AtomicU64,
    pub sid: AtomicU64,
    /// Raw wait-status once the process is a zombie.
    pub exit_status: AtomicI32,
    /// Own usage.
    pub rusage: Mutex<Rusage>,
    /// Usage aggregated from reaped children.
    pub child_rusage: Mutex<Rusage>,
    /// Parent sleeps here in wait4.
    pub wait_q: WaitQueue,
    /// Vfork rendezvous: the parent sleeps here until the child execs or
    /// exits.
    pub vfork_q: WaitQueue,
    pub vfork_active: AtomicBool,
    /// Stopped by SIGSTOP (job control); reported via WUNTRACED.
    pub stopped: AtomicBool,
    /// Resumed by SIGCONT since the last wait; reported via WCONTINUED.
    pub continued: AtomicBool,
}

impl Process {
    pub fn new(pid: Pid, parent: Pid, name: String, space: Arc<AddressSpace>) -> Self {
        Self {
            pid,
            parent: AtomicU64::new(parent),
            state: AtomicU32::new(ProcState::Running as u32),
            name: Mutex::new(name),
            space: Mutex::new(space),
            threads: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            fds: RwLock::new(FdTable::new()),
            creds: Mutex::new(Credentials::root()),
            actions: Mutex::new(ActionTable::new()),
            pending: AtomicU64::new(0),
            cwd: Mutex::new(String::from("/")),
            root: Mutex::new(String::from("/")),
            umask: AtomicU32::new(0o022),
            pgid: AtomicU64::new(pid),
            sid: AtomicU64::new(pid),
            exit_status: AtomicI32::new(0),
            rusage: Mutex::new(Rusage::default()),
            child_rusage: Mutex::new(Rusage::default()),
            wait_q: WaitQueue::new(),
            vfork_q: WaitQueue::new(),
            vfork_active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            continued: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ProcState {
        match self.state.load(Ordering::Acquire) {
            0 => ProcState::Running,
            1 => ProcState::Zombie,
            _ => ProcState::Dead,
        }
    }

    pub fn set_state(&self, state: ProcState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn parent_pid(&self) -> Pid {
        self.parent.load(Ordering::Acquire)
    }

    pub fn set_parent(&self, pid: Pid) {
        self.parent.store(pid, Ordering::Release);
    }

    pub fn umask(&self) -> u32 {
        self.umask.load(Ordering::Acquire)
    }

    /// Swap the umask, returning the previous value.
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & 0o777, Ordering::AcqRel)
    }

    /// Raise a process-directed signal; any thread not blocking it may
    /// deliver.
    pub fn post_signal(&self, sig: u8) {
        self.pending
            .fetch_or(super::signal::sig_bit(sig), Ordering::SeqCst);
    }

    pub fn take_signal(&self, sig: u8) {
        self.pending
            .fetch_and(!super::signal::sig_bit(sig), Ordering::SeqCst);
    }

    /// Whether wait4 can report this process right now.
    pub fn is_waitable(&self, report_stopped: bool, report_continued: bool) -> bool {
        match self.state() {
            ProcState::Zombie => true,
            ProcState::Running => {
                (report_stopped && self.stopped.load(Ordering::Acquire))
                    || (report_continued && self.continued.load(Ordering::Acquire))
            }
            ProcState::Dead => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::space::test_support;

    fn fresh(pid: Pid) -> Process {
        let _g = test_support::lock();
        Process::new(
            pid,
            1,
            String::from("test"),
            Arc::new(AddressSpace::new().unwrap()),
        )
    }

    #[test]
    fn new_process_defaults() {
        let p = fresh(10);
        assert_eq!(p.state(), ProcState::Running);
        assert_eq!(p.parent_pid(), 1);
        assert_eq!(p.umask(), 0o022);
        // Own group and session until told otherwise.
        assert_eq!(p.pgid.load(Ordering::Relaxed), 10);
        assert_eq!(p.sid.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn umask_swap_returns_old() {
        let p = fresh(11);
        assert_eq!(p.set_umask(0o077), 0o022);
        assert_eq!(p.umask(), 0o077);
        // Extra bits are stripped.
        p.set_umask(0o7777);
        assert_eq!(p.umask(), 0o777);
    }

    #[test]
    fn waitable_states() {
        let p = fresh(12);
        assert!(!p.is_waitable(false, false));
        p.stopped.store(true, Ordering::Release);
        assert!(p.is_waitable(true, false));
        assert!(!p.is_waitable(false, false));
        p.set_state(ProcState::Zombie);
        assert!(p.is_waitable(false, false));
    }

    #[test]
    fn rusage_accumulation() {
        let mut a = Rusage {
            user_ticks: 10,
            system_ticks: 5,
            page_faults: 2,
            max_rss_pages: 30,
        };
        let b = Rusage {
            user_ticks: 1,
            system_ticks: 2,
            page_faults: 3,
            max_rss_pages: 50,
        };
        a.accumulate(&b);
        assert_eq!(a.user_ticks, 11);
        assert_eq!(a.system_ticks, 7);
        assert_eq!(a.page_faults, 5);
        assert_eq!(a.max_rss_pages, 50);
    }
}
