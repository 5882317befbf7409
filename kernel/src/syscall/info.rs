//! Time, identity, accounting, and platform system calls

#[cfg(feature = "alloc")]
extern crate alloc;

use core::sync::atomic::Ordering;

use crate::{
    error::{KernelError, KernelResult},
    mm::user,
    power,
};

use super::SyscallCtx;

/// Fixed-size uname field.
const UTS_FIELD: usize = 65;

pub fn sys_time(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let secs = crate::ticks() / crate::TICKS_PER_SEC;
    if ctx.args[0] != 0 {
        user::copyout(&ctx.space(), ctx.args[0] as u64, &secs.to_le_bytes())?;
    }
    Ok(secs as usize)
}

/// `clock_gettime(clock, timespec)`; the monotonic tick counter backs
/// every clock id.
pub fn sys_clock_gettime(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if ctx.args[0] > 3 {
        return Err(KernelError::Invalid);
    }
    let ticks = crate::ticks();
    let secs = ticks / crate::TICKS_PER_SEC;
    let nanos = (ticks % crate::TICKS_PER_SEC) * (1_000_000_000 / crate::TICKS_PER_SEC);
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&secs.to_le_bytes());
    out[8..16].copy_from_slice(&nanos.to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[1] as u64, &out)?;
    Ok(0)
}

pub fn sys_clock_settime(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    // The tick counter is monotonic; wall-clock adjustment is not
    // supported.
    Err(KernelError::NotSupported)
}

pub fn sys_clock_getres(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if ctx.args[0] > 3 {
        return Err(KernelError::Invalid);
    }
    let mut out = [0u8; 16];
    out[8..16].copy_from_slice(&(1_000_000_000 / crate::TICKS_PER_SEC).to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[1] as u64, &out)?;
    Ok(0)
}

/// `times(tms)`: four tick counters, self then reaped children.
pub fn sys_times(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let own = *ctx.proc_.rusage.lock();
    let children = *ctx.proc_.child_rusage.lock();
    let mut out = [0u8; 32];
    out[0..8].copy_from_slice(&own.user_ticks.to_le_bytes());
    out[8..16].copy_from_slice(&own.system_ticks.to_le_bytes());
    out[16..24].copy_from_slice(&children.user_ticks.to_le_bytes());
    out[24..32].copy_from_slice(&children.system_ticks.to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[0] as u64, &out)?;
    Ok(crate::ticks() as usize)
}

const RUSAGE_SELF: usize = 0;
const RUSAGE_CHILDREN: usize = usize::MAX; // -1

pub fn sys_getrusage(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let usage = match ctx.args[0] {
        RUSAGE_SELF => *ctx.proc_.rusage.lock(),
        RUSAGE_CHILDREN => *ctx.proc_.child_rusage.lock(),
        _ => return Err(KernelError::Invalid),
    };
    let mut out = [0u8; 32];
    out[0..8].copy_from_slice(&usage.user_ticks.to_le_bytes());
    out[8..16].copy_from_slice(&usage.system_ticks.to_le_bytes());
    out[16..24].copy_from_slice(&usage.page_faults.to_le_bytes());
    out[24..32].copy_from_slice(&usage.max_rss_pages.to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[1] as u64, &out)?;
    Ok(0)
}

/// Resource-limit slots; everything reports "unlimited" and accepts
/// root-only updates it does not yet enforce.
const RLIMIT_COUNT: usize = 8;
const RLIM_INFINITY: u64 = u64::MAX;

pub fn sys_getrlimit(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if ctx.args[0] >= RLIMIT_COUNT {
        return Err(KernelError::Invalid);
    }
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&RLIM_INFINITY.to_le_bytes());
    out[8..16].copy_from_slice(&RLIM_INFINITY.to_le_bytes());
    user::copyout(&ctx.space(), ctx.args[1] as u64, &out)?;
    Ok(0)
}

pub fn sys_setrlimit(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if ctx.args[0] >= RLIMIT_COUNT {
        return Err(KernelError::Invalid);
    }
    let mut raw = [0u8; 16];
    user::copyin(&ctx.space(), ctx.args[1] as u64, &mut raw)?;
    let soft = u64::from_le_bytes(raw[0..8].try_into().unwrap());
    let hard = u64::from_le_bytes(raw[8..16].try_into().unwrap());
    if soft > hard {
        return Err(KernelError::Invalid);
    }
    Ok(0)
}

pub fn sys_getpriority(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.thread.priority() as usize)
}

pub fn sys_setpriority(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let prio = ctx.args[2];
    if prio >= crate::sched::PRIORITY_LEVELS {
        return Err(KernelError::Invalid);
    }
    // Raising priority (lower value) needs privilege.
    if (prio as u32) < ctx.thread.priority.load(Ordering::Acquire)
        && !ctx.proc_.creds.lock().is_root()
    {
        return Err(KernelError::AccessDenied);
    }
    ctx.thread.priority.store(prio as u32, Ordering::Release);
    Ok(0)
}

pub fn sys_umask(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(ctx.proc_.set_umask(ctx.args[0] as u32) as usize)
}

fn uts_field(s: &str) -> [u8; UTS_FIELD] {
    let mut out = [0u8; UTS_FIELD];
    let bytes = s.as_bytes();
    let n = bytes.len().min(UTS_FIELD - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// `uname(utsname)`: five NUL-padded 65-byte fields.
pub fn sys_uname(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let mut out = [0u8; UTS_FIELD * 5];
    out[0..UTS_FIELD].copy_from_slice(&uts_field("VermilionOS"));
    out[UTS_FIELD..2 * UTS_FIELD].copy_from_slice(&uts_field("vermilion"));
    out[2 * UTS_FIELD..3 * UTS_FIELD].copy_from_slice(&uts_field(env!("CARGO_PKG_VERSION")));
    out[3 * UTS_FIELD..4 * UTS_FIELD].copy_from_slice(&uts_field("vermilion-kernel"));
    #[cfg(target_arch = "x86_64")]
    out[4 * UTS_FIELD..].copy_from_slice(&uts_field("x86_64"));
    #[cfg(target_arch = "aarch64")]
    out[4 * UTS_FIELD..].copy_from_slice(&uts_field("aarch64"));
    #[cfg(target_arch = "riscv64")]
    out[4 * UTS_FIELD..].copy_from_slice(&uts_field("riscv64"));
    user::copyout(&ctx.space(), ctx.args[0] as u64, &out)?;
    Ok(0)
}

/// `reboot(cmd)`: shutdown, reboot, or the sleep states, routed to
/// whichever power backend initialized (ACPI, PSCI, or syscon).
pub fn sys_reboot(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    let cmd = power::RebootCmd::from_raw(ctx.args[0])?;
    power::reboot(cmd)?;
    Ok(0)
}

/// Kernel modules are outside this kernel's core.
pub fn sys_kmload(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    Err(KernelError::NotSupported)
}

pub fn sys_kmunload(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    if !ctx.proc_.creds.lock().is_root() {
        return Err(KernelError::NotPermitted);
    }
    Err(KernelError::NotSupported)
}
