//! Futexes
//!
//! Private (per-process) futexes only; the wait queue is keyed by
//! `(pid, address)` so the same address in different processes never
//! aliases. Only FUTEX_WAIT and FUTEX_WAKE are accepted, and WAIT
//! re-checks the word before sleeping.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::collections::BTreeMap;
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::user,
    process::signal,
    sched::WaitQueue,
};

use super::SyscallCtx;

const FUTEX_WAIT: usize = 0;
const FUTEX_WAKE: usize = 1;
/// Required: shared cross-process futexes are not supported.
const FUTEX_PRIVATE: usize = 128;

type FutexKey = (u64, u64);

static FUTEX_TABLE: Mutex<BTreeMap<FutexKey, WaitQueue>> = Mutex::new(BTreeMap::new());

/// Sleepers on one process-local futex word.
fn waiter_count(key: FutexKey) -> usize {
    FUTEX_TABLE.lock().get(&key).map(|wq| wq.len()).unwrap_or(0)
}

/// `futex(uaddr, op, val, timeout, ...)`.
pub fn sys_futex(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let uaddr = ctx.args[0] as u64;
    let op = ctx.args[1];
    let val = ctx.args[2] as u32;

    if op & FUTEX_PRIVATE == 0 {
        return Err(KernelError::NotSupported);
    }
    if uaddr == 0 || uaddr % 4 != 0 {
        return Err(KernelError::Invalid);
    }
    let key: FutexKey = (ctx.proc_.pid, uaddr);

    match op & !FUTEX_PRIVATE {
        FUTEX_WAIT => futex_wait(ctx, key, uaddr, val),
        FUTEX_WAKE => Ok(futex_wake(key, val as usize)),
        _ => Err(KernelError::NoSyscall),
    }
}

/// Read the current futex word through the copy primitives.
fn load_word(ctx: &SyscallCtx, uaddr: u64) -> KernelResult<u32> {
    let mut raw = [0u8; 4];
    user::copyin(&ctx.space(), uaddr, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn futex_wait(ctx: &SyscallCtx, key: FutexKey, uaddr: u64, expected: u32) -> KernelResult<usize> {
    // Re-check before sleeping: a word that already changed means the
    // wake happened first.
    if load_word(ctx, uaddr)? != expected {
        return Err(KernelError::WouldBlock);
    }

    let tid = ctx.thread.tid;
    ctx.thread.futex_addr.store(uaddr, Ordering::Release);
    {
        let mut table = FUTEX_TABLE.lock();
        table.entry(key).or_default().register(tid);
    }

    loop {
        // The waker clears futex_addr when it pops us off the queue.
        if ctx.thread.futex_addr.load(Ordering::Acquire) == 0 {
            return Ok(0);
        }
        let pending = ctx.thread.pending.load(Ordering::SeqCst)
            | ctx.proc_.pending.load(Ordering::SeqCst);
        if signal::next_deliverable(pending, ctx.thread.sigmask()).is_some() {
            remove_waiter(key, tid);
            ctx.thread.futex_addr.store(0, Ordering::Release);
            return Err(KernelError::Interrupted);
        }
        crate::sched::yield_cpu();
        #[cfg(not(target_os = "none"))]
        {
            remove_waiter(key, tid);
            ctx.thread.futex_addr.store(0, Ordering::Release);
            return Ok(0); // Host tests never block.
        }
    }
}

fn remove_waiter(key: FutexKey, tid: u64) {
    let mut table = FUTEX_TABLE.lock();
    if let Some(wq) = table.get_mut(&key) {
        wq.remove(tid);
        if wq.is_empty() {
            table.remove(&key);
        }
    }
}

/// Wake at most `n` waiters; returns how many were woken. Never more
/// than are currently sleeping on the address.
fn futex_wake(key: FutexKey, n: usize) -> usize {
    let mut woken = 0;
    let mut table = FUTEX_TABLE.lock();
    if let Some(wq) = table.get_mut(&key) {
        while woken < n {
            match wq.wake_one() {
                Some(tid) => {
                    if let Some(thread) = crate::process::table::get_thread(tid) {
                        thread.futex_addr.store(0, Ordering::Release);
                    }
                    woken += 1;
                }
                None => break,
            }
        }
        if wq.is_empty() {
            table.remove(&key);
        }
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_caps_at_sleeper_count() {
        let key: FutexKey = (991, 0x1000);
        {
            let mut table = FUTEX_TABLE.lock();
            let wq = table.entry(key).or_default();
            wq.register(10_001);
            wq.register(10_002);
            wq.register(10_003);
        }
        assert_eq!(waiter_count(key), 3);
        // Wake 2 of 3.
        assert_eq!(futex_wake(key, 2), 2);
        assert_eq!(waiter_count(key), 1);
        // Asking for 10 wakes only the remaining 1.
        assert_eq!(futex_wake(key, 10), 1);
        assert_eq!(futex_wake(key, 10), 0);
        assert_eq!(waiter_count(key), 0);
    }

    #[test]
    fn keys_isolate_processes() {
        let a: FutexKey = (1001, 0x2000);
        let b: FutexKey = (1002, 0x2000);
        FUTEX_TABLE.lock().entry(a).or_default().register(20_001);
        // Same address, different process: nothing to wake.
        assert_eq!(futex_wake(b, 1), 0);
        assert_eq!(futex_wake(a, 1), 1);
    }
}
