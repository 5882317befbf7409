//! Process groups and sessions
//!
//! Nested tagged containers for job control: every process is in exactly
//! one group, every group in exactly one session, and a group's session
//! is fixed once set. Member lists are guarded by their own locks; the
//! containers hold member PIDs, never strong process references.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::{table, Pid};

/// A process group.
struct Group {
    sid: u64,
    members: Vec<Pid>,
}

/// A session: a set of groups.
struct Session {
    groups: Vec<u64>,
}

static GROUPS: Mutex<BTreeMap<u64, Group>> = Mutex::new(BTreeMap::new());
static SESSIONS: Mutex<BTreeMap<u64, Session>> = Mutex::new(BTreeMap::new());

/// Place a process into a group within a session, creating both as
/// needed. Used at boot for init and by fork to inherit membership.
pub fn join(pid: Pid, pgid: u64, sid: u64) {
    let mut sessions = SESSIONS.lock();
    let session = sessions.entry(sid).or_insert_with(|| Session {
        groups: Vec::new(),
    });
    if !session.groups.contains(&pgid) {
        session.groups.push(pgid);
    }
    drop(sessions);

    let mut groups = GROUPS.lock();
    let group = groups.entry(pgid).or_insert_with(|| Group {
        sid,
        members: Vec::new(),
    });
    if !group.members.contains(&pid) {
        group.members.push(pid);
    }
}

/// Remove a process from its group, dissolving empty containers.
pub fn leave(pid: Pid, pgid: u64) {
    let mut groups = GROUPS.lock();
    let Some(group) = groups.get_mut(&pgid) else {
        return;
    };
    group.members.retain(|&p| p != pid);
    if group.members.is_empty() {
        let sid = group.sid;
        groups.remove(&pgid);
        let mut sessions = SESSIONS.lock();
        if let Some(session) = sessions.get_mut(&sid) {
            session.groups.retain(|&g| g != pgid);
            if session.groups.is_empty() {
                sessions.remove(&sid);
            }
        }
    }
}

/// Whether any group with this id exists (the setsid obstacle check).
pub fn group_exists(pgid: u64) -> bool {
    GROUPS.lock().contains_key(&pgid)
}

/// Session a group belongs to.
pub fn session_of_group(pgid: u64) -> Option<u64> {
    GROUPS.lock().get(&pgid).map(|g| g.sid)
}

/// Member PIDs of a group.
pub fn members(pgid: u64) -> Vec<Pid> {
    GROUPS
        .lock()
        .get(&pgid)
        .map(|g| g.members.clone())
        .unwrap_or_default()
}

/// `setsid`: make the caller the leader of a fresh session and group.
///
/// Fails with EPERM if any existing group's id equals the caller's PID
/// (the caller is, or once was, a group leader).
pub fn setsid(pid: Pid) -> KernelResult<u64> {
    if group_exists(pid) {
        return Err(KernelError::NotPermitted);
    }
    let process = table::get_process(pid).ok_or(KernelError::NoProcess)?;
    let old_pgid = process.pgid.load(Ordering::Acquire);
    leave(pid, old_pgid);
    join(pid, pid, pid);
    process.pgid.store(pid, Ordering::Release);
    process.sid.store(pid, Ordering::Release);
    Ok(pid)
}

/// `setpgid`: move `pid` into group `pgid` (0 = its own PID). The target
/// group must live in the caller's session, or be freshly created with
/// id == pid.
pub fn setpgid(pid: Pid, pgid: u64) -> KernelResult<()> {
    let process = table::get_process(pid).ok_or(KernelError::NoProcess)?;
    let sid = process.sid.load(Ordering::Acquire);
    let target = if pgid == 0 { pid } else { pgid };

    // A session leader may not move.
    if sid == pid && target != process.pgid.load(Ordering::Acquire) {
        return Err(KernelError::NotPermitted);
    }

    if target != pid {
        // Joining an existing group: it must be in the same session.
        match session_of_group(target) {
            Some(group_sid) if group_sid == sid => {}
            _ => return Err(KernelError::NotPermitted),
        }
    }

    let old = process.pgid.swap(target, Ordering::AcqRel);
    if old != target {
        leave(pid, old);
        join(pid, target, sid);
    }
    Ok(())
}

/// Deliver a signal to every member of a group.
pub fn signal_group(pgid: u64, sig: u8) -> KernelResult<usize> {
    let pids = members(pgid);
    if pids.is_empty() {
        return Err(KernelError::NoProcess);
    }
    let mut hit = 0;
    for pid in pids {
        if let Some(process) = table::get_process(pid) {
            super::deliver_to_process(&process, sig);
            hit += 1;
        }
    }
    Ok(hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{space::test_support, AddressSpace};
    use alloc::string::String;
    use alloc::sync::Arc;

    fn spawn(parent: Pid) -> Arc<super::super::process::Process> {
        let pid = table::alloc_id();
        let p = Arc::new(super::super::process::Process::new(
            pid,
            parent,
            String::from("g"),
            Arc::new(AddressSpace::new().unwrap()),
        ));
        table::insert_process(p.clone());
        join(pid, pid, pid);
        p
    }

    #[test]
    fn setsid_rejects_existing_group_leader() {
        let _g = test_support::lock();
        let p = spawn(1);
        // p already leads a group with id == pid.
        assert_eq!(setsid(p.pid), Err(KernelError::NotPermitted));
        leave(p.pid, p.pid);
        table::remove_process(p.pid);
    }

    #[test]
    fn setsid_creates_fresh_session() {
        let _g = test_support::lock();
        let leader = spawn(1);
        let child = spawn(leader.pid);
        // Child joined its own group at spawn; dissolve it to mimic a
        // fork inheriting the parent's group.
        leave(child.pid, child.pid);
        child.pgid.store(leader.pid, Ordering::Release);
        child.sid.store(leader.pid, Ordering::Release);
        join(child.pid, leader.pid, leader.pid);

        let sid = setsid(child.pid).unwrap();
        assert_eq!(sid, child.pid);
        assert_eq!(child.pgid.load(Ordering::Relaxed), child.pid);
        assert!(group_exists(child.pid));
        assert_eq!(session_of_group(child.pid), Some(child.pid));

        leave(child.pid, child.pid);
        leave(leader.pid, leader.pid);
        table::remove_process(child.pid);
        table::remove_process(leader.pid);
    }

    #[test]
    fn setpgid_requires_same_session() {
        let _g = test_support::lock();
        let a = spawn(1);
        let b = spawn(1);
        // b's group lives in b's own session, not a's.
        assert_eq!(setpgid(a.pid, b.pid), Err(KernelError::NotPermitted));
        leave(a.pid, a.pid);
        leave(b.pid, b.pid);
        table::remove_process(a.pid);
        table::remove_process(b.pid);
    }

    #[test]
    fn group_dissolves_when_last_member_leaves() {
        let _g = test_support::lock();
        let p = spawn(1);
        assert!(group_exists(p.pid));
        leave(p.pid, p.pid);
        assert!(!group_exists(p.pid));
        table::remove_process(p.pid);
    }
}
