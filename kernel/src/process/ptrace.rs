//! Ptrace state machine
//!
//! Tracee-side state driven by `PTRACE_*` requests from the tracer and by
//! the trap dispatcher at syscall-enter/exit and single-step exception
//! points. A stop parks the tracee on its ptrace waitq; the tracer
//! observes it through `wait4`.

use crate::error::{KernelError, KernelResult};

use super::Pid;

/// Tracee run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtraceState {
    /// Not traced.
    #[default]
    None,
    /// Stopped, tracer notified.
    Stopped,
    /// Running until the next syscall boundary.
    Syscall,
    /// Running freely under a tracer.
    Running,
    /// Single-stepping one instruction.
    Onestep,
}

/// Ptrace requests the kernel accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtraceRequest {
    TraceMe,
    Cont,
    Syscall,
    SingleStep,
    Attach,
    Detach,
    PeekData,
    PokeData,
    GetRegs,
}

impl PtraceRequest {
    pub fn from_raw(req: usize) -> KernelResult<Self> {
        match req {
            0 => Ok(Self::TraceMe),
            1 => Ok(Self::PeekData),
            4 => Ok(Self::PokeData),
            7 => Ok(Self::Cont),
            9 => Ok(Self::SingleStep),
            12 => Ok(Self::GetRegs),
            16 => Ok(Self::Attach),
            17 => Ok(Self::Detach),
            24 => Ok(Self::Syscall),
            _ => Err(KernelError::Invalid),
        }
    }
}

/// Per-thread tracing record.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtraceInfo {
    pub state: PtraceState,
    /// PID of the tracer (0 = none).
    pub tracer: Pid,
    /// Signal that caused the current stop, reported through wait4.
    pub stop_signal: u8,
    /// Distinguishes syscall-enter from syscall-exit stops.
    pub in_syscall_stop: bool,
}

impl PtraceInfo {
    pub fn is_traced(&self) -> bool {
        self.state != PtraceState::None
    }

    /// Transition for a resume-class request; returns the new run state.
    pub fn resume(&mut self, request: PtraceRequest) -> KernelResult<()> {
        if self.state != PtraceState::Stopped {
            return Err(KernelError::NoProcess);
        }
        self.state = match request {
            PtraceRequest::Cont => PtraceState::Running,
            PtraceRequest::Syscall => PtraceState::Syscall,
            PtraceRequest::SingleStep => PtraceState::Onestep,
            _ => return Err(KernelError::Invalid),
        };
        self.stop_signal = 0;
        Ok(())
    }

    /// Enter a stop with the given signal.
    pub fn stop(&mut self, sig: u8) {
        self.state = PtraceState::Stopped;
        self.stop_signal = sig;
    }

    /// Whether the dispatcher must stop at syscall boundaries.
    pub fn wants_syscall_stops(&self) -> bool {
        self.state == PtraceState::Syscall
    }

    /// Whether the debug/single-step exception belongs to us.
    pub fn wants_singlestep(&self) -> bool {
        self.state == PtraceState::Onestep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_requires_a_stop() {
        let mut info = PtraceInfo {
            state: PtraceState::Running,
            tracer: 1,
            ..Default::default()
        };
        assert!(info.resume(PtraceRequest::Cont).is_err());
        info.stop(5);
        assert_eq!(info.state, PtraceState::Stopped);
        assert_eq!(info.stop_signal, 5);
        assert!(info.resume(PtraceRequest::Syscall).is_ok());
        assert_eq!(info.state, PtraceState::Syscall);
        assert!(info.wants_syscall_stops());
    }

    #[test]
    fn singlestep_transition() {
        let mut info = PtraceInfo::default();
        info.tracer = 7;
        info.stop(19);
        info.resume(PtraceRequest::SingleStep).unwrap();
        assert!(info.wants_singlestep());
        assert!(!info.wants_syscall_stops());
    }

    #[test]
    fn request_decoding() {
        assert_eq!(PtraceRequest::from_raw(0), Ok(PtraceRequest::TraceMe));
        assert_eq!(PtraceRequest::from_raw(24), Ok(PtraceRequest::Syscall));
        assert!(PtraceRequest::from_raw(999).is_err());
    }
}
