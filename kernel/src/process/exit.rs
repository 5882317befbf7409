//! Thread and process exit
//!
//! A process becomes a zombie when its last thread exits: user memory is
//! released immediately, children are reparented to init, and the parent
//! is notified through SIGCHLD and its wait queue. The zombie itself
//! lingers until reaped by wait4.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use super::{
    clone, group,
    process::{ProcState, Process},
    signal::SIGCHLD,
    table,
    thread::ThreadState,
    wait, Pid, Tid,
};

/// PID of init, the reparenting target.
pub const INIT_PID: Pid = 1;

/// Tear down one thread (exec killing siblings, or thread exit).
pub fn terminate_thread(tid: Tid) {
    if let Some(thread) = table::get_thread(tid) {
        thread.set_state(ThreadState::Zombie);
        crate::sched::this_cpu().dequeue(tid);
        if let Some(process) = table::get_process(thread.pid) {
            process.threads.lock().retain(|&t| t != tid);
        }
        table::remove_thread(tid);
    }
}

/// Exit the calling thread with the given wait status. If it was the
/// last thread, the whole process exits.
pub fn exit_thread(process: &Arc<Process>, tid: Tid, wstatus: i32) {
    let last = {
        let mut threads = process.threads.lock();
        threads.retain(|&t| t != tid);
        threads.is_empty()
    };
    if let Some(thread) = table::get_thread(tid) {
        thread.set_state(ThreadState::Zombie);
        crate::sched::this_cpu().dequeue(tid);
    }
    table::remove_thread(tid);
    if last {
        exit_process(process, wstatus);
    }
}

/// Turn the process into a zombie and notify everyone who cares.
pub fn exit_process(process: &Arc<Process>, wstatus: i32) {
    process.exit_status.store(wstatus, Ordering::Release);

    // User memory goes now; the PCB lingers for the reaper.
    process.space.lock().clear();

    // Descriptors drop now so pipe peers see EOF/EPIPE.
    *process.fds.write() = crate::fs::FdTable::new();

    // Children are inherited by init.
    let orphans: Vec<Pid> = core::mem::take(&mut *process.children.lock());
    if let Some(init) = table::get_process(INIT_PID) {
        for pid in orphans {
            if let Some(child) = table::get_process(pid) {
                child.set_parent(INIT_PID);
                init.children.lock().push(pid);
            }
        }
    }

    process.set_state(ProcState::Zombie);

    // A vforked parent stops waiting no matter how the child went.
    clone::vfork_release(process);

    // Wake the parent: SIGCHLD plus its wait queue.
    if let Some(parent) = table::get_process(process.parent_pid()) {
        super::deliver_to_process(&parent, SIGCHLD);
        parent.wait_q.wake_all();
    }
}

/// Kill-style termination with a signal status.
pub fn kill_process(process: &Arc<Process>, sig: u8) {
    let tids: Vec<Tid> = process.threads.lock().clone();
    for tid in tids {
        terminate_thread(tid);
    }
    process.threads.lock().clear();
    exit_process(process, wait::signaled_status(sig));
}

/// Final disposal after wait4 has consumed the status.
pub fn reap(process: &Arc<Process>) {
    process.set_state(ProcState::Dead);
    group::leave(process.pid, process.pgid.load(Ordering::Acquire));
    table::remove_process(process.pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{space::test_support, AddressSpace};
    use alloc::string::String;

    fn spawn_pair() -> (Arc<Process>, Arc<Process>) {
        let ppid = table::alloc_id();
        let parent = Arc::new(Process::new(
            ppid,
            0,
            String::from("p"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        table::insert_process(parent.clone());
        group::join(ppid, ppid, ppid);

        let cpid = table::alloc_id();
        let child = Arc::new(Process::new(
            cpid,
            ppid,
            String::from("c"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        parent.children.lock().push(cpid);
        table::insert_process(child.clone());
        group::join(cpid, cpid, cpid);
        (parent, child)
    }

    #[test]
    fn exit_marks_zombie_and_signals_parent() {
        let _g = test_support::lock();
        let (parent, child) = spawn_pair();
        exit_process(&child, 7 << 8);
        assert_eq!(child.state(), ProcState::Zombie);
        assert_eq!(child.exit_status.load(Ordering::Relaxed), 7 << 8);
        // Parent got SIGCHLD.
        assert_ne!(
            parent.pending.load(Ordering::SeqCst) & super::super::signal::sig_bit(SIGCHLD),
            0
        );
        reap(&child);
        assert!(!table::pid_exists(child.pid));
        group::leave(parent.pid, parent.pid);
        table::remove_process(parent.pid);
    }

    #[test]
    fn orphans_reparent_to_init() {
        let _g = test_support::lock();
        // Build an init to inherit.
        let init = Arc::new(Process::new(
            INIT_PID,
            0,
            String::from("init"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        let had_init = table::get_process(INIT_PID).is_some();
        if !had_init {
            table::insert_process(init.clone());
        }

        let (parent, child) = spawn_pair();
        let grand_pid = table::alloc_id();
        let grand = Arc::new(Process::new(
            grand_pid,
            child.pid,
            String::from("g"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        child.children.lock().push(grand_pid);
        table::insert_process(grand.clone());

        exit_process(&child, 0);
        assert_eq!(grand.parent_pid(), INIT_PID);

        table::remove_process(grand_pid);
        reap(&child);
        group::leave(parent.pid, parent.pid);
        table::remove_process(parent.pid);
        if !had_init {
            table::remove_process(INIT_PID);
        }
    }
}
