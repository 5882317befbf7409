//! Memory system calls

use crate::{
    error::{KernelError, KernelResult},
    mm::{page_round_up, MapFlags, Prot, PAGE_SIZE},
};

use super::SyscallCtx;

// User-facing protection bits.
const PROT_READ: usize = 1;
const PROT_WRITE: usize = 2;
const PROT_EXEC: usize = 4;
const PROT_UC: usize = 8;
const PROT_WC: usize = 16;
const PROT_WB: usize = 32;

// User-facing map flags.
const MAP_SHARED: usize = 1;
const MAP_PRIVATE: usize = 2;
const MAP_FIXED: usize = 4;
const MAP_EXCL: usize = 8;
const MAP_ANONYMOUS: usize = 16;

fn decode_prot(raw: usize) -> KernelResult<Prot> {
    if raw & !(PROT_READ | PROT_WRITE | PROT_EXEC | PROT_UC | PROT_WC | PROT_WB) != 0 {
        return Err(KernelError::Invalid);
    }
    let mut prot = Prot::empty();
    if raw & PROT_READ != 0 {
        prot |= Prot::READ;
    }
    if raw & PROT_WRITE != 0 {
        prot |= Prot::WRITE;
    }
    if raw & PROT_EXEC != 0 {
        prot |= Prot::EXEC;
    }
    if raw & PROT_UC != 0 {
        prot |= Prot::UNCACHED;
    }
    if raw & PROT_WC != 0 {
        prot |= Prot::WRITE_COMBINE;
    }
    if raw & PROT_WB != 0 {
        prot |= Prot::WRITE_BACK;
    }
    Ok(prot)
}

fn decode_flags(raw: usize) -> KernelResult<MapFlags> {
    if raw & !(MAP_SHARED | MAP_PRIVATE | MAP_FIXED | MAP_EXCL | MAP_ANONYMOUS) != 0 {
        return Err(KernelError::Invalid);
    }
    let mut flags = MapFlags::empty();
    if raw & MAP_SHARED != 0 {
        flags |= MapFlags::SHARED;
    }
    if raw & MAP_PRIVATE != 0 {
        flags |= MapFlags::PRIVATE;
    }
    if raw & MAP_FIXED != 0 {
        flags |= MapFlags::FIXED;
    }
    if raw & MAP_EXCL != 0 {
        flags |= MapFlags::EXCL;
    }
    if raw & MAP_ANONYMOUS != 0 {
        flags |= MapFlags::ANONYMOUS;
    }
    Ok(flags)
}

/// `mmap(hint, len, prot, flags, fd, offset)`.
///
/// SHARED is reserved and rejected; exactly one of SHARED|PRIVATE is
/// required; `W∧X` is rejected. Without FIXED the hint is advisory; with
/// FIXED|EXCL any overlap fails; with FIXED alone the overlap is
/// unmapped first. All of that is enforced by the space engine.
pub fn sys_mmap(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let [hint, len, prot_raw, flags_raw, fd, offset] = ctx.args;
    let prot = decode_prot(prot_raw)?;
    let flags = decode_flags(flags_raw)?;
    let file = if flags.contains(MapFlags::ANONYMOUS) {
        if fd != usize::MAX {
            return Err(KernelError::Invalid);
        }
        None
    } else {
        let open = ctx.proc_.fds.read().get(fd)?;
        // Only objects that can page into a zone are mappable.
        Some(open.ops.clone().vm_file().ok_or(KernelError::NotSupported)?)
    };
    let base = ctx
        .space()
        .map(hint as u64, offset as u64, len, prot, flags, file)?;
    Ok(base as usize)
}

/// `munmap(addr, len)`: covers arbitrary byte ranges, splitting zones.
pub fn sys_munmap(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let [addr, len, ..] = ctx.args;
    ctx.space().unmap(addr as u64, len)?;
    Ok(0)
}

/// `mprotect(addr, len, prot)`.
pub fn sys_mprotect(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let [addr, len, prot_raw, ..] = ctx.args;
    let prot = decode_prot(prot_raw)?;
    ctx.space().protect(addr as u64, len, prot)?;
    Ok(0)
}

/// `madvise` validates and accepts; the engine keeps no advice state.
pub fn sys_madvise(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let [addr, len, _advice, ..] = ctx.args;
    if addr % PAGE_SIZE != 0 || len == 0 {
        return Err(KernelError::Invalid);
    }
    let _ = page_round_up(len);
    Ok(0)
}

/// `msync` forwards to the backing object; anonymous memory has nothing
/// to sync.
pub fn sys_msync(ctx: &mut SyscallCtx) -> KernelResult<usize> {
    let [addr, len, ..] = ctx.args;
    if addr % PAGE_SIZE != 0 || len == 0 {
        return Err(KernelError::Invalid);
    }
    ctx.space()
        .zone_at(addr as u64)
        .ok_or(KernelError::OutOfMemory)?;
    Ok(0)
}

pub fn sys_getpagesize(_ctx: &mut SyscallCtx) -> KernelResult<usize> {
    Ok(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prot_decoding_rejects_unknown_bits() {
        assert!(decode_prot(PROT_READ | PROT_WRITE).is_ok());
        assert!(decode_prot(1 << 30).is_err());
    }

    #[test]
    fn flags_decoding() {
        let f = decode_flags(MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED).unwrap();
        assert!(f.contains(MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED));
        assert!(decode_flags(1 << 20).is_err());
    }
}
