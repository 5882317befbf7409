//! Signal system calls

use core::sync::atomic::Ordering;

use crate::{
    error::{KernelError, KernelResult},
    mm::user,
    process::signal::{
        sanitize_mask, AltStack, MaskOp, SaFlags, SigAction, SigHandler, SigSet,
    },
};

use super::SyscallCtx;

/// Handler sentinel values in the user ABI.
const SIG_DFL: u64 = 0;
const SIG_IGN: u64 = 1;

/// Wire form of struct sigaction: handler, mask, flags.
const SIGACTION_SIZE: usize = 8 + 8 + 4;

fn decode_action(raw: &[u8; SIGACTION_SIZE]) -> SigAction {
    let handler_raw = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let mask = u64::from_le_bytes(raw[8..16].try_into().unwrap());
    let flags = u32::from_le_bytes(raw[16..20].try_into().unwrap());
    let handler = match handler_raw {
        SIG_DFL => SigHandler::Default,
        SIG_IGN => SigHandler::Ignore,
        addr => SigHandler::Handler(addr),
    };
    SigAction {
        handler,
        mask: sanitize_mask(mask),
        flags: SaFlags::from_bits_truncate(flags),
    }
}

fn encode_action(action: &SigAction) -> [u8; SIGACTION_SIZE] {
    let mut out = [0u8; SIGACTION_SIZE];
    let handler_raw = match action.handler {
        SigHandler::Default => SIG_DFL,
        SigHandler::Ignore => SIG_IGN,
        SigHandler::Handler(addr) => addr,
    };
    out[0..8].copy_from_slice(&handler_raw.to_le_bytes());
    out[8..16].copy_from_slice(&action.mask.to_le_bytes());
    out[16..20].copy_from_slice(&action.flags.bits().to_le_bytes());
    out
}

/// `sigaction(sig, act, oldact)`.
pub fn sys_sigaction(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let sig = ctx.args[0] as u8;
    let act_ptr = ctx.args[1] as u64;
    let old_ptr = ctx.args[2] as u64;
    let space = ctx.space();

    let old = if act_ptr != 0 {
        let mut raw = [0u8; SIGACTION_SIZE];
        user::copyin(&space, act_ptr, &mut raw)?;
        ctx.proc_.actions.lock().set(sig, decode_action(&raw))?
    } else {
        ctx.proc_.actions.lock().get(sig)?
    };
    if old_ptr != 0 {
        user::copyout(&space, old_ptr, &encode_action(&old))?;
    }
    Ok(0)
}

/// `sigprocmask(how, set, oldset)`: SIGKILL/SIGSTOP bits never stick.
pub fn sys_sigprocmask(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let op = MaskOp::from_raw(ctx.args[0])?;
    let set_ptr = ctx.args[1] as u64;
    let old_ptr = ctx.args[2] as u64;
    let space = ctx.space();

    let old = ctx.thread.sigmask();
    if old_ptr != 0 {
        user::copyout(&space, old_ptr, &old.to_le_bytes())?;
    }
    if set_ptr != 0 {
        let mut raw = [0u8; 8];
        user::copyin(&space, set_ptr, &mut raw)?;
        let arg = SigSet::from_le_bytes(raw);
        ctx.thread.set_sigmask(op.apply(old, arg));
    }
    Ok(0)
}

/// `sigpending(set)`.
pub fn sys_sigpending(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let pending = (ctx.thread.pending.load(Ordering::SeqCst)
        | ctx.proc_.pending.load(Ordering::SeqCst))
        & ctx.thread.sigmask();
    user::copyout(&ctx.space(), ctx.args[0] as u64, &pending.to_le_bytes())?;
    Ok(0)
}

/// `sigsuspend(mask)`: atomically install the mask and block until a
/// signal is delivered; always returns EINTR.
pub fn sys_sigsuspend(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let mut raw = [0u8; 8];
    user::copyin(&ctx.space(), ctx.args[0] as u64, &mut raw)?;
    let temp_mask = sanitize_mask(SigSet::from_le_bytes(raw));

    let old = ctx.thread.sigmask();
    // The old mask comes back after the handler runs.
    *ctx.thread.saved_mask.lock() = Some(old);
    ctx.thread.set_sigmask(temp_mask);

    loop {
        let pending = ctx.thread.pending.load(Ordering::SeqCst)
            | ctx.proc_.pending.load(Ordering::SeqCst);
        if crate::process::signal::next_deliverable(pending, temp_mask).is_some() {
            break;
        }
        crate::sched::yield_cpu();
        #[cfg(not(target_os = "none"))]
        break; // Host tests never block here.
    }
    Err(KernelError::Interrupted)
}

/// `sigaltstack(ss, old_ss)`. The stack cannot change while a handler is
/// running on it.
pub fn sys_sigaltstack(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let ss_ptr = ctx.args[0] as u64;
    let old_ptr = ctx.args[1] as u64;
    let space = ctx.space();

    let current = *ctx.thread.altstack.lock();
    if old_ptr != 0 {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&current.base.to_le_bytes());
        out[8..16].copy_from_slice(&(current.size as u64).to_le_bytes());
        // ss_flags: SS_ONSTACK while nested.
        let flags: u64 = if current.nesting > 0 { 1 } else { 0 };
        out[16..24].copy_from_slice(&flags.to_le_bytes());
        user::copyout(&space, old_ptr, &out)?;
    }
    if ss_ptr != 0 {
        if current.nesting > 0 {
            return Err(KernelError::NotPermitted);
        }
        let mut raw = [0u8; 24];
        user::copyin(&space, ss_ptr, &mut raw)?;
        let base = u64::from_le_bytes(raw[0..8].try_into().unwrap());
        let size = u64::from_le_bytes(raw[8..16].try_into().unwrap()) as usize;
        if size != 0 && size < 2048 {
            return Err(KernelError::OutOfMemory);
        }
        *ctx.thread.altstack.lock() = AltStack {
            base,
            size,
            nesting: 0,
        };
    }
    Ok(0)
}

/// The sigreturn magic syscall; the heavy lifting (frame validation,
/// mask restore, altstack nesting) lives in the trap layer.
pub fn sys_sigreturn(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    crate::trap::sigreturn(ctx.proc_, ctx.thread, ctx.tf)?;
    // If sigsuspend parked a mask, it comes back now.
    if let Some(saved) = ctx.thread.saved_mask.lock().take() {
        ctx.thread.set_sigmask(saved);
    }
    // The return value register was restored from the frame; keep it.
    Ok(ctx.tf.syscall_number())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::signal::{sig_bit, SIGKILL, SIGTERM};

    #[test]
    fn action_wire_round_trip() {
        let action = SigAction {
            handler: SigHandler::Handler(0xdead_b000),
            mask: sig_bit(SIGTERM),
            flags: SaFlags::ONSTACK | SaFlags::RESTART,
        };
        let decoded = decode_action(&encode_action(&action));
        assert_eq!(decoded.handler, action.handler);
        assert_eq!(decoded.mask, action.mask);
        assert_eq!(decoded.flags, action.flags);
    }

    #[test]
    fn decode_strips_unblockable_bits() {
        let mut raw = [0u8; SIGACTION_SIZE];
        raw[8..16].copy_from_slice(&(sig_bit(SIGKILL) | sig_bit(SIGTERM)).to_le_bytes());
        let decoded = decode_action(&raw);
        assert_eq!(decoded.mask, sig_bit(SIGTERM));
    }

    #[test]
    fn sentinels_decode_to_dispositions() {
        let mut raw = [0u8; SIGACTION_SIZE];
        raw[0..8].copy_from_slice(&SIG_IGN.to_le_bytes());
        assert_eq!(decode_action(&raw).handler, SigHandler::Ignore);
        raw[0..8].copy_from_slice(&SIG_DFL.to_le_bytes());
        assert_eq!(decode_action(&raw).handler, SigHandler::Default);
    }
}
