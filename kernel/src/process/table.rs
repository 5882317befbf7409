//! Global process and thread tables
//!
//! The weak side of every parent/child and tracer/tracee edge: PIDs and
//! TIDs resolve to strong `Arc`s only through these maps, under the
//! global list locks. PIDs and TIDs share one id space so a thread-group
//! leader's TID equals its PID.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::{process::Process, thread::Thread, Pid, Tid};

static PROCESSES: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());
static THREADS: Mutex<BTreeMap<Tid, Arc<Thread>>> = Mutex::new(BTreeMap::new());

/// Shared PID/TID counter; id 1 is init.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh id.
pub fn alloc_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::SeqCst)
}

pub fn insert_process(process: Arc<Process>) {
    PROCESSES.lock().insert(process.pid, process);
}

pub fn remove_process(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES.lock().remove(&pid)
}

pub fn get_process(pid: Pid) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&pid).cloned()
}

/// Whether a PID is still visible (zombie or live).
pub fn pid_exists(pid: Pid) -> bool {
    PROCESSES.lock().contains_key(&pid)
}

pub fn insert_thread(thread: Arc<Thread>) {
    THREADS.lock().insert(thread.tid, thread);
}

pub fn remove_thread(tid: Tid) -> Option<Arc<Thread>> {
    THREADS.lock().remove(&tid)
}

pub fn get_thread(tid: Tid) -> Option<Arc<Thread>> {
    THREADS.lock().get(&tid).cloned()
}

/// Children of `pid`, resolved under the list lock.
pub fn find_children(pid: Pid) -> Vec<Pid> {
    PROCESSES
        .lock()
        .values()
        .filter(|p| p.parent_pid() == pid && p.state() != super::process::ProcState::Dead)
        .map(|p| p.pid)
        .collect()
}

/// Every process in the given group.
pub fn processes_in_group(pgid: u64) -> Vec<Arc<Process>> {
    PROCESSES
        .lock()
        .values()
        .filter(|p| p.pgid.load(Ordering::Acquire) == pgid)
        .cloned()
        .collect()
}

/// Snapshot of all live PIDs (diagnostics, /proc-style listings).
pub fn all_pids() -> Vec<Pid> {
    PROCESSES.lock().keys().copied().collect()
}

/// The thread running on this CPU.
pub fn current_thread() -> Option<Arc<Thread>> {
    crate::sched::current_tid().and_then(get_thread)
}

/// The process owning the thread running on this CPU.
pub fn current_process() -> Option<Arc<Process>> {
    current_thread().and_then(|t| get_process(t.pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::space::test_support;
    use crate::mm::AddressSpace;
    use alloc::string::String;

    fn make_process(parent: Pid) -> Arc<Process> {
        let pid = alloc_id();
        let space = Arc::new(AddressSpace::new().unwrap());
        let p = Arc::new(Process::new(pid, parent, String::from("t"), space));
        insert_process(p.clone());
        p
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = alloc_id();
        let b = alloc_id();
        assert!(b > a);
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let _g = test_support::lock();
        let p = make_process(1);
        assert!(pid_exists(p.pid));
        assert!(get_process(p.pid).is_some());
        remove_process(p.pid);
        assert!(!pid_exists(p.pid));
    }

    #[test]
    fn children_resolve_through_weak_pids() {
        let _g = test_support::lock();
        let parent = make_process(1);
        let child_a = make_process(parent.pid);
        let child_b = make_process(parent.pid);
        let kids = find_children(parent.pid);
        assert!(kids.contains(&child_a.pid));
        assert!(kids.contains(&child_b.pid));
        remove_process(child_a.pid);
        remove_process(child_b.pid);
        remove_process(parent.pid);
    }
}
