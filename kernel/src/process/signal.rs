//! Signal model
//!
//! Sixty-four signal slots per process. SIGKILL and SIGSTOP can be
//! neither caught nor blocked; attempts to mask them are silently
//! stripped, so their bits never appear in any thread's mask at any
//! observable point. Delivery is checked at every kernel-to-user
//! boundary by the trap dispatcher.

#![allow(dead_code)]

use crate::error::{KernelError, KernelResult};

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQUIT: u8 = 3;
pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGABRT: u8 = 6;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGKILL: u8 = 9;
pub const SIGUSR1: u8 = 10;
pub const SIGSEGV: u8 = 11;
pub const SIGUSR2: u8 = 12;
pub const SIGPIPE: u8 = 13;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGSTOP: u8 = 19;
pub const SIGTSTP: u8 = 20;
pub const SIGTTIN: u8 = 21;
pub const SIGTTOU: u8 = 22;
pub const SIGURG: u8 = 23;
pub const SIGXCPU: u8 = 24;
pub const SIGXFSZ: u8 = 25;
pub const SIGVTALRM: u8 = 26;
pub const SIGPROF: u8 = 27;
pub const SIGWINCH: u8 = 28;
pub const SIGIO: u8 = 29;
pub const SIGSYS: u8 = 31;

/// Number of signal-action slots per process.
pub const SIG_COUNT: usize = 64;

/// A set of signals; bit `n - 1` stands for signal `n`.
pub type SigSet = u64;

/// Bit for one signal number.
pub const fn sig_bit(sig: u8) -> SigSet {
    1 << (sig - 1)
}

/// Signals that can never be blocked, caught, or ignored away.
pub const UNBLOCKABLE: SigSet = sig_bit(SIGKILL) | sig_bit(SIGSTOP);

/// Strip SIGKILL/SIGSTOP from a would-be mask.
pub const fn sanitize_mask(mask: SigSet) -> SigSet {
    mask & !UNBLOCKABLE
}

/// `sigprocmask` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Block,
    Unblock,
    SetMask,
}

impl MaskOp {
    pub fn from_raw(how: usize) -> KernelResult<Self> {
        match how {
            0 => Ok(Self::Block),
            1 => Ok(Self::Unblock),
            2 => Ok(Self::SetMask),
            _ => Err(KernelError::Invalid),
        }
    }

    /// Apply this operation to a mask; the result never contains
    /// unblockable bits.
    pub fn apply(self, current: SigSet, arg: SigSet) -> SigSet {
        let next = match self {
            Self::Block => current | arg,
            Self::Unblock => current & !arg,
            Self::SetMask => arg,
        };
        sanitize_mask(next)
    }
}

bitflags::bitflags! {
    /// `sigaction` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u32 {
        /// Do not receive SIGCHLD when children stop.
        const NOCLDSTOP = 1 << 0;
        /// Deliver on the alternate stack.
        const ONSTACK   = 1 << 3;
        /// Restart interruptible syscalls.
        const RESTART   = 1 << 4;
        /// Do not add the signal to the mask while handling it.
        const NODEFER   = 1 << 5;
        /// Reset to default after one delivery.
        const RESETHAND = 1 << 6;
        /// Three-argument handler form.
        const SIGINFO   = 1 << 7;
    }
}

/// What happens when a signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    /// User handler entry point.
    Handler(u64),
}

/// One slot of the per-process action table.
#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: SigHandler,
    /// Added to the thread mask for the handler's duration.
    pub mask: SigSet,
    pub flags: SaFlags,
}

impl Default for SigAction {
    fn default() -> Self {
        Self {
            handler: SigHandler::Default,
            mask: 0,
            flags: SaFlags::empty(),
        }
    }
}

/// Default disposition classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Terminate,
    /// Terminate with a core-style status.
    Core,
    Ignore,
    Stop,
    Continue,
}

/// Default disposition of a signal number.
pub fn default_disposition(sig: u8) -> Disposition {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH | SIGIO => Disposition::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => Disposition::Stop,
        SIGCONT => Disposition::Continue,
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
        | SIGSYS => Disposition::Core,
        _ => Disposition::Terminate,
    }
}

/// The per-process action table.
pub struct ActionTable {
    actions: [SigAction; SIG_COUNT],
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionTable {
    pub const fn new() -> Self {
        Self {
            actions: [SigAction {
                handler: SigHandler::Default,
                mask: 0,
                flags: SaFlags::empty(),
            }; SIG_COUNT],
        }
    }

    /// Install an action. SIGKILL and SIGSTOP are immutable.
    pub fn set(&mut self, sig: u8, action: SigAction) -> KernelResult<SigAction> {
        if sig == 0 || sig as usize > SIG_COUNT {
            return Err(KernelError::Invalid);
        }
        if sig == SIGKILL || sig == SIGSTOP {
            return Err(KernelError::Invalid);
        }
        let slot = &mut self.actions[sig as usize - 1];
        let old = *slot;
        *slot = SigAction {
            mask: sanitize_mask(action.mask),
            ..action
        };
        Ok(old)
    }

    pub fn get(&self, sig: u8) -> KernelResult<SigAction> {
        if sig == 0 || sig as usize > SIG_COUNT {
            return Err(KernelError::Invalid);
        }
        Ok(self.actions[sig as usize - 1])
    }

    /// Reset caught handlers to default, keeping ignores. The exec
    /// contract.
    pub fn reset_for_exec(&mut self) {
        for action in &mut self.actions {
            if matches!(action.handler, SigHandler::Handler(_)) {
                *action = SigAction::default();
            }
        }
    }
}

/// Alternate signal stack with the `SS_ONSTACK` nesting counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AltStack {
    pub base: u64,
    pub size: usize,
    /// Re-entry depth while handlers run on this stack.
    pub nesting: u32,
}

impl AltStack {
    /// Whether `sp` currently points into the alternate stack.
    pub fn contains(&self, sp: u64) -> bool {
        self.size != 0 && sp >= self.base && sp < self.base + self.size as u64
    }

    /// Top of the stack for a fresh handler frame.
    pub fn top(&self) -> u64 {
        self.base + self.size as u64
    }
}

/// Pick the lowest pending, unmasked signal, if any.
pub fn next_deliverable(pending: SigSet, mask: SigSet) -> Option<u8> {
    let ready = pending & !sanitize_mask(mask);
    if ready == 0 {
        return None;
    }
    Some(ready.trailing_zeros() as u8 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_and_stop_bits_never_enter_a_mask() {
        let m = MaskOp::Block.apply(0, sig_bit(SIGKILL) | sig_bit(SIGTERM));
        assert_eq!(m, sig_bit(SIGTERM));
        let m = MaskOp::SetMask.apply(0, !0);
        assert_eq!(m & UNBLOCKABLE, 0);
    }

    #[test]
    fn mask_set_then_restore_round_trips() {
        let original = sig_bit(SIGUSR1) | sig_bit(SIGALRM);
        let old = original;
        let m = MaskOp::SetMask.apply(original, sig_bit(SIGTERM));
        assert_eq!(m, sig_bit(SIGTERM));
        let restored = MaskOp::SetMask.apply(m, old);
        assert_eq!(restored, original);
    }

    #[test]
    fn action_table_protects_kill_and_stop() {
        let mut table = ActionTable::new();
        let action = SigAction {
            handler: SigHandler::Handler(0x40_0000),
            mask: 0,
            flags: SaFlags::empty(),
        };
        assert!(table.set(SIGKILL, action).is_err());
        assert!(table.set(SIGSTOP, action).is_err());
        assert!(table.set(SIGINT, action).is_ok());
        assert_eq!(
            table.get(SIGINT).unwrap().handler,
            SigHandler::Handler(0x40_0000)
        );
    }

    #[test]
    fn exec_resets_only_caught_handlers() {
        let mut table = ActionTable::new();
        table
            .set(
                SIGINT,
                SigAction {
                    handler: SigHandler::Handler(0x1000),
                    mask: 0,
                    flags: SaFlags::empty(),
                },
            )
            .unwrap();
        table
            .set(
                SIGUSR1,
                SigAction {
                    handler: SigHandler::Ignore,
                    mask: 0,
                    flags: SaFlags::empty(),
                },
            )
            .unwrap();
        table.reset_for_exec();
        assert_eq!(table.get(SIGINT).unwrap().handler, SigHandler::Default);
        assert_eq!(table.get(SIGUSR1).unwrap().handler, SigHandler::Ignore);
    }

    #[test]
    fn delivery_order_is_lowest_signal_first() {
        let pending = sig_bit(SIGTERM) | sig_bit(SIGINT);
        assert_eq!(next_deliverable(pending, 0), Some(SIGINT));
        // Masking SIGINT exposes SIGTERM.
        assert_eq!(next_deliverable(pending, sig_bit(SIGINT)), Some(SIGTERM));
        assert_eq!(next_deliverable(0, 0), None);
    }

    #[test]
    fn masking_cannot_hide_sigkill() {
        let pending = sig_bit(SIGKILL);
        assert_eq!(next_deliverable(pending, !0), Some(SIGKILL));
    }

    #[test]
    fn altstack_containment() {
        let ss = AltStack {
            base: 0x7000_0000,
            size: 8192,
            nesting: 0,
        };
        assert!(ss.contains(0x7000_0100));
        assert!(!ss.contains(0x7000_2000));
        assert_eq!(ss.top(), 0x7000_2000);
    }

    #[test]
    fn default_dispositions() {
        assert_eq!(default_disposition(SIGCHLD), Disposition::Ignore);
        assert_eq!(default_disposition(SIGSEGV), Disposition::Core);
        assert_eq!(default_disposition(SIGTERM), Disposition::Terminate);
        assert_eq!(default_disposition(SIGSTOP), Disposition::Stop);
        assert_eq!(default_disposition(SIGCONT), Disposition::Continue);
    }
}
