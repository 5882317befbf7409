//! Scheduling
//!
//! Parallel preemptive multitasking with one ready queue per CPU, a
//! per-CPU `current` thread pointer, and a `must_resched` flag toggled by
//! timer ticks and cross-CPU IPIs. Policy is priority-based pick-lowest
//! and nothing more; work stealing and affinity are deliberately absent.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{collections::VecDeque, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::sync::once_lock::OnceLock;

/// Thread identifier (shared with the process layer).
pub type Tid = u64;

/// Number of priority levels; 0 is the highest.
pub const PRIORITY_LEVELS: usize = 8;

/// Default priority for new threads.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Per-CPU scheduler state.
pub struct CpuState {
    pub id: usize,
    /// TID of the running thread (0 = idle).
    current: AtomicU64,
    /// Set by timer ticks and reschedule IPIs; consumed at the next
    /// kernel-exit boundary.
    must_resched: AtomicBool,
    /// Ready queues, one per priority level.
    ready: Mutex<[VecDeque<Tid>; PRIORITY_LEVELS]>,
}

impl CpuState {
    fn new(id: usize) -> Self {
        Self {
            id,
            current: AtomicU64::new(0),
            must_resched: AtomicBool::new(false),
            ready: Mutex::new(Default::default()),
        }
    }

    pub fn current_tid(&self) -> Option<Tid> {
        match self.current.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    pub fn set_current(&self, tid: Option<Tid>) {
        self.current.store(tid.unwrap_or(0), Ordering::Release);
    }

    /// Queue a thread at the given priority.
    pub fn enqueue(&self, tid: Tid, priority: u8) {
        let level = (priority as usize).min(PRIORITY_LEVELS - 1);
        self.ready.lock()[level].push_back(tid);
    }

    /// Remove a thread from the ready queues (e.g. it was killed while
    /// queued).
    pub fn dequeue(&self, tid: Tid) {
        let mut queues = self.ready.lock();
        for q in queues.iter_mut() {
            q.retain(|&t| t != tid);
        }
    }

    /// Pop the highest-priority ready thread.
    pub fn pick_next(&self) -> Option<Tid> {
        let mut queues = self.ready.lock();
        for q in queues.iter_mut() {
            if let Some(tid) = q.pop_front() {
                return Some(tid);
            }
        }
        None
    }

    /// Request a reschedule at the next opportunity.
    pub fn set_must_resched(&self) {
        self.must_resched.store(true, Ordering::SeqCst);
    }

    /// Consume the reschedule flag.
    pub fn take_must_resched(&self) -> bool {
        self.must_resched.swap(false, Ordering::SeqCst)
    }

    /// Number of queued threads (diagnostics).
    pub fn queued(&self) -> usize {
        self.ready.lock().iter().map(|q| q.len()).sum()
    }
}

static CPUS: OnceLock<Vec<CpuState>> = OnceLock::new();

/// Bring up the per-CPU scheduler state. Called once during init.
pub fn init(cpu_count: usize) {
    let _ = CPUS.set((0..cpu_count.max(1)).map(CpuState::new).collect());
}

/// Per-CPU state for `cpu_id`, falling back to CPU 0 for out-of-range ids.
pub fn cpu(cpu_id: usize) -> &'static CpuState {
    let cpus = CPUS.get_or_init(|| alloc::vec![CpuState::new(0)]);
    cpus.get(cpu_id).unwrap_or(&cpus[0])
}

/// State of the executing CPU.
pub fn this_cpu() -> &'static CpuState {
    cpu(crate::arch::cpu_id())
}

/// TID of the thread running on this CPU.
pub fn current_tid() -> Option<Tid> {
    this_cpu().current_tid()
}

/// Number of CPUs brought up.
pub fn cpu_count() -> usize {
    CPUS.get().map(|c| c.len()).unwrap_or(1)
}

/// Queue a thread on the executing CPU.
pub fn enqueue(tid: Tid, priority: u8) {
    this_cpu().enqueue(tid, priority);
}

/// Request a reschedule on `cpu_id`, sending an IPI if it is remote.
///
/// The IPI handler consults the flag and reschedules cooperatively; this
/// is the only cross-CPU scheduling trigger.
pub fn need_resched(cpu_id: usize) {
    cpu(cpu_id).set_must_resched();
    if cpu_id != crate::arch::cpu_id() {
        crate::irq::send_reschedule(cpu_id);
    }
}

/// Give up the CPU until something else has run.
///
/// Blocking paths loop on their predicate around this call; the actual
/// thread switch happens at the trap-return boundary.
pub fn yield_cpu() {
    this_cpu().set_must_resched();
    #[cfg(target_os = "none")]
    crate::arch::wait_for_interrupt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// A sleep queue attached to a synchronization object.
///
/// Threads register, sleep, and are woken by a signaler. Wake-ups mark
/// the thread ready and queue it; the sleeper re-checks its predicate.
pub struct WaitQueue {
    waiters: Mutex<VecDeque<Tid>>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Add the thread to the queue. The caller marks itself blocked and
    /// re-checks its predicate after waking.
    pub fn register(&self, tid: Tid) {
        self.waiters.lock().push_back(tid);
    }

    /// Remove a thread (predicate satisfied before sleeping, or signal
    /// interruption).
    pub fn remove(&self, tid: Tid) {
        self.waiters.lock().retain(|&t| t != tid);
    }

    /// Wake the longest-waiting thread; returns its TID.
    pub fn wake_one(&self) -> Option<Tid> {
        let tid = self.waiters.lock().pop_front()?;
        enqueue(tid, DEFAULT_PRIORITY);
        Some(tid)
    }

    /// Wake at most `n` threads; returns how many were woken. Never wakes
    /// more than are currently sleeping.
    pub fn wake_some(&self, n: usize) -> usize {
        let mut woken = 0;
        while woken < n {
            if self.wake_one().is_none() {
                break;
            }
            woken += 1;
        }
        woken
    }

    /// Wake everything.
    pub fn wake_all(&self) -> usize {
        self.wake_some(usize::MAX)
    }

    /// Number of sleepers.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_queues_respect_priority() {
        let cpu = CpuState::new(0);
        cpu.enqueue(10, 5);
        cpu.enqueue(11, 1);
        cpu.enqueue(12, 5);
        assert_eq!(cpu.pick_next(), Some(11));
        assert_eq!(cpu.pick_next(), Some(10));
        assert_eq!(cpu.pick_next(), Some(12));
        assert_eq!(cpu.pick_next(), None);
    }

    #[test]
    fn dequeue_removes_from_any_level() {
        let cpu = CpuState::new(0);
        cpu.enqueue(7, 0);
        cpu.enqueue(8, 7);
        cpu.dequeue(8);
        assert_eq!(cpu.queued(), 1);
        assert_eq!(cpu.pick_next(), Some(7));
        assert_eq!(cpu.pick_next(), None);
    }

    #[test]
    fn must_resched_is_consumed_once() {
        let cpu = CpuState::new(0);
        assert!(!cpu.take_must_resched());
        cpu.set_must_resched();
        assert!(cpu.take_must_resched());
        assert!(!cpu.take_must_resched());
    }

    #[test]
    fn wait_queue_wakes_at_most_n() {
        let wq = WaitQueue::new();
        wq.register(1);
        wq.register(2);
        wq.register(3);
        assert_eq!(wq.wake_some(2), 2);
        assert_eq!(wq.len(), 1);
        // Never more than are sleeping.
        assert_eq!(wq.wake_some(10), 1);
        assert_eq!(wq.wake_some(10), 0);
    }

    #[test]
    fn wait_queue_remove_prevents_wake() {
        let wq = WaitQueue::new();
        wq.register(5);
        wq.remove(5);
        assert_eq!(wq.wake_one(), None);
    }

    #[test]
    fn out_of_range_priority_clamps() {
        let cpu = CpuState::new(0);
        cpu.enqueue(42, 200);
        assert_eq!(cpu.pick_next(), Some(42));
    }
}
