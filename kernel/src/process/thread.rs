//! Threads
//!
//! The schedulable unit. A thread exclusively owns its kernel stack and
//! saved trapframe; everything else it reaches through its process.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::{FpuState, Trapframe};

use super::{
    ptrace::PtraceInfo,
    signal::{sanitize_mask, AltStack, SigSet},
    Pid, Tid,
};

/// Kernel stack size per thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Thread run states.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but not yet released by its creator.
    Paused = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    /// Stopped by SIGSTOP or a ptrace stop.
    Stopped = 4,
    /// Exited, waiting to be reaped.
    Zombie = 5,
}

impl ThreadState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Paused,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Stopped,
            _ => Self::Zombie,
        }
    }
}

/// The schedulable unit.
pub struct Thread {
    pub tid: Tid,
    /// Owning process.
    pub pid: Pid,
    state: AtomicU32,
    pub priority: AtomicU32,
    /// Saved register context; rebuilt by traps and sigreturn.
    pub trapframe: Mutex<Trapframe>,
    /// Architecture FPU blob, saved lazily at switch time.
    pub fpu: Mutex<FpuState>,
    /// Exclusively owned kernel stack.
    kernel_stack: Mutex<Vec<u8>>,
    /// TLS base installed on switch-in.
    pub tls_base: AtomicU64,
    /// Blocked-signal mask; never contains SIGKILL/SIGSTOP bits.
    sigmask: AtomicU64,
    /// Thread-directed pending signals.
    pub pending: AtomicU64,
    /// Mask saved by sigsuspend, restored after delivery.
    pub saved_mask: Mutex<Option<SigSet>>,
    pub altstack: Mutex<AltStack>,
    pub ptrace: Mutex<PtraceInfo>,
    /// Futex word this thread sleeps on (0 = none).
    pub futex_addr: AtomicU64,
    /// CPU usage in timer ticks.
    pub cpu_ticks: AtomicU64,
}

impl Thread {
    pub fn new(tid: Tid, pid: Pid, priority: u8) -> Self {
        let mut stack = Vec::new();
        stack.resize(KERNEL_STACK_SIZE, 0u8);
        Self {
            tid,
            pid,
            state: AtomicU32::new(ThreadState::Paused as u32),
            priority: AtomicU32::new(priority as u32),
            trapframe: Mutex::new(Trapframe::default()),
            fpu: Mutex::new(FpuState::default()),
            kernel_stack: Mutex::new(stack),
            tls_base: AtomicU64::new(0),
            sigmask: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            saved_mask: Mutex::new(None),
            altstack: Mutex::new(AltStack::default()),
            ptrace: Mutex::new(PtraceInfo::default()),
            futex_addr: AtomicU64::new(0),
            cpu_ticks: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Blocked-signal mask.
    pub fn sigmask(&self) -> SigSet {
        self.sigmask.load(Ordering::Acquire)
    }

    /// Replace the mask; SIGKILL/SIGSTOP bits are stripped.
    pub fn set_sigmask(&self, mask: SigSet) {
        self.sigmask.store(sanitize_mask(mask), Ordering::Release);
    }

    /// Raise a thread-directed signal.
    pub fn post_signal(&self, sig: u8) {
        self.pending
            .fetch_or(super::signal::sig_bit(sig), Ordering::SeqCst);
    }

    /// Clear one pending signal bit.
    pub fn take_signal(&self, sig: u8) {
        self.pending
            .fetch_and(!super::signal::sig_bit(sig), Ordering::SeqCst);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed) as u8
    }

    /// Top of the kernel stack, for the trap entry path.
    pub fn kernel_stack_top(&self) -> u64 {
        let stack = self.kernel_stack.lock();
        stack.as_ptr() as u64 + stack.len() as u64
    }

    pub fn add_cpu_ticks(&self, ticks: u64) {
        self.cpu_ticks.fetch_add(ticks, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::signal::{sig_bit, SIGKILL, SIGSTOP, SIGTERM};

    #[test]
    fn new_thread_starts_paused() {
        let t = Thread::new(2, 1, 4);
        assert_eq!(t.state(), ThreadState::Paused);
        assert_eq!(t.priority(), 4);
        assert_eq!(t.sigmask(), 0);
    }

    #[test]
    fn sigmask_never_holds_kill_or_stop() {
        let t = Thread::new(3, 1, 4);
        t.set_sigmask(sig_bit(SIGKILL) | sig_bit(SIGSTOP) | sig_bit(SIGTERM));
        assert_eq!(t.sigmask(), sig_bit(SIGTERM));
    }

    #[test]
    fn post_and_take_signal() {
        let t = Thread::new(4, 1, 4);
        t.post_signal(SIGTERM);
        assert_ne!(t.pending.load(Ordering::SeqCst) & sig_bit(SIGTERM), 0);
        t.take_signal(SIGTERM);
        assert_eq!(t.pending.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn kernel_stack_is_aligned_and_sized() {
        let t = Thread::new(5, 1, 4);
        let top = t.kernel_stack_top();
        assert!(top > KERNEL_STACK_SIZE as u64);
    }
}
