//! Program execution
//!
//! `execve` replaces the calling process's address space with a fresh one
//! built from an ELF image: PT_LOAD segments become file- and
//! zero-backed zones, the initial stack is marshaled with argv/envp per
//! the user ABI, caught signal handlers reset to default, and
//! close-on-exec descriptors drop. Any sibling threads are terminated
//! before the replacement proceeds.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use crate::{
    arch::Trapframe,
    error::{KernelError, KernelResult},
    fs::ramfs::RamFs,
    mm::{
        space::{AddressSpace, MapFlags, Prot, STACK_TOP},
        user, PAGE_SIZE,
    },
};

use super::{clone, process::Process, table, thread::Thread};

/// Initial user stack size.
const STACK_SIZE: usize = 8 * 1024 * 1024;

/// Hard cap on the marshaled argv/envp block.
const ARG_BLOCK_MAX: usize = 128 * 1024;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// One loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub offset: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub prot: Prot,
}

/// Parsed executable image.
#[derive(Debug, Clone)]
pub struct ElfImage {
    pub entry: u64,
    pub segments: Vec<LoadSegment>,
}

fn read_u16(b: &[u8], off: usize) -> KernelResult<u16> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(KernelError::Invalid)
}

fn read_u32(b: &[u8], off: usize) -> KernelResult<u32> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(KernelError::Invalid)
}

fn read_u64(b: &[u8], off: usize) -> KernelResult<u64> {
    b.get(off..off + 8)
        .map(|s| u64::from_le_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
        .ok_or(KernelError::Invalid)
}

/// Parse an ELF64 little-endian executable.
pub fn parse_elf(image: &[u8]) -> KernelResult<ElfImage> {
    if image.len() < 64 || image[..4] != ELF_MAGIC {
        return Err(KernelError::Invalid);
    }
    if image[4] != ELFCLASS64 {
        return Err(KernelError::Invalid);
    }
    let e_type = read_u16(image, 16)?;
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(KernelError::Invalid);
    }
    let entry = read_u64(image, 24)?;
    let phoff = read_u64(image, 32)? as usize;
    let phentsize = read_u16(image, 54)? as usize;
    let phnum = read_u16(image, 56)? as usize;
    if phentsize < 56 || phnum > 128 {
        return Err(KernelError::Invalid);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(image, ph)? != PT_LOAD {
            continue;
        }
        let flags = read_u32(image, ph + 4)?;
        let offset = read_u64(image, ph + 8)?;
        let vaddr = read_u64(image, ph + 16)?;
        let file_size = read_u64(image, ph + 32)?;
        let mem_size = read_u64(image, ph + 40)?;
        if mem_size < file_size || vaddr % PAGE_SIZE as u64 != offset % PAGE_SIZE as u64 {
            return Err(KernelError::Invalid);
        }
        let mut prot = Prot::empty();
        if flags & PF_R != 0 {
            prot |= Prot::READ;
        }
        if flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        // W and X never combine; writable wins and the segment loses
        // execute.
        if flags & PF_X != 0 && flags & PF_W == 0 {
            prot |= Prot::EXEC;
        }
        segments.push(LoadSegment {
            vaddr,
            offset,
            file_size,
            mem_size,
            prot,
        });
    }
    if segments.is_empty() {
        return Err(KernelError::Invalid);
    }
    Ok(ElfImage { entry, segments })
}

/// Build the initial stack block: strings grow down, then the
/// NULL-terminated envp and argv pointer arrays, then argc at the final
/// stack pointer. Returns the stack pointer.
pub fn marshal_stack(
    space: &AddressSpace,
    argv: &[String],
    envp: &[String],
) -> KernelResult<u64> {
    let strings_len: usize = argv.iter().chain(envp.iter()).map(|s| s.len() + 1).sum();
    let vec_len = (argv.len() + 1 + envp.len() + 1 + 1) * 8;
    if strings_len + vec_len > ARG_BLOCK_MAX {
        return Err(KernelError::OutOfRange);
    }

    // Copy the strings out, recording their addresses.
    let mut cursor = STACK_TOP;
    let mut addrs: Vec<u64> = Vec::with_capacity(argv.len() + envp.len());
    for s in argv.iter().chain(envp.iter()) {
        cursor -= s.len() as u64 + 1;
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        user::copyout(space, cursor, &bytes)?;
        addrs.push(cursor);
    }

    // Pointer block, 16-byte aligned at the final sp.
    let mut block: Vec<u8> = Vec::with_capacity(vec_len);
    block.extend_from_slice(&(argv.len() as u64).to_le_bytes());
    for &addr in &addrs[..argv.len()] {
        block.extend_from_slice(&addr.to_le_bytes());
    }
    block.extend_from_slice(&0u64.to_le_bytes());
    for &addr in &addrs[argv.len()..] {
        block.extend_from_slice(&addr.to_le_bytes());
    }
    block.extend_from_slice(&0u64.to_le_bytes());

    let mut sp = cursor - block.len() as u64;
    sp &= !0xF;
    user::copyout(space, sp, &block)?;
    Ok(sp)
}

/// Replace the process image.
pub fn execve(
    process: &Arc<Process>,
    thread: &Arc<Thread>,
    path: &str,
    argv: Vec<String>,
    envp: Vec<String>,
) -> KernelResult<()> {
    let file = RamFs::lookup_file(path)?;
    let image = parse_elf(&file.snapshot())?;

    // Sibling threads must be gone before the space is replaced.
    let siblings: Vec<u64> = process
        .threads
        .lock()
        .iter()
        .copied()
        .filter(|&t| t != thread.tid)
        .collect();
    for tid in siblings {
        super::exit::terminate_thread(tid);
    }

    // Build the fresh space.
    let space = Arc::new(AddressSpace::new()?);
    for seg in &image.segments {
        let zone_base = seg.vaddr & !(PAGE_SIZE as u64 - 1);
        let lead = seg.vaddr - zone_base;
        if seg.file_size > 0 {
            let backing: Arc<dyn crate::mm::space::VmFile> = file.clone();
            space.map(
                zone_base,
                seg.offset - lead,
                (lead + seg.file_size) as usize,
                seg.prot,
                MapFlags::PRIVATE | MapFlags::FIXED,
                Some(backing),
            )?;
        }
        // Zero-backed tail (bss).
        let file_end = zone_base + crate::mm::page_round_up((lead + seg.file_size) as usize) as u64;
        let mem_end = seg.vaddr + seg.mem_size;
        if mem_end > file_end {
            space.map(
                file_end,
                0,
                (mem_end - file_end) as usize,
                seg.prot,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
                None,
            )?;
        }
    }

    // Stack, with the argument block marshaled on top.
    space.map(
        STACK_TOP - STACK_SIZE as u64,
        0,
        STACK_SIZE,
        Prot::READ | Prot::WRITE,
        MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
        None,
    )?;
    let sp = marshal_stack(&space, &argv, &envp)?;

    // Point of no return: swap the space and reset the inherited state.
    *process.space.lock() = space;
    process.actions.lock().reset_for_exec();
    process.fds.write().close_on_exec();
    if let Some(name) = argv.first() {
        *process.name.lock() = name.clone();
    } else {
        *process.name.lock() = String::from(path);
    }
    thread.tls_base.store(0, Ordering::Release);
    *thread.trapframe.lock() = Trapframe::new_user(image.entry, sp);

    // The vfork parent resumes once the child has its own image.
    clone::vfork_release(process);

    // A traced child stops with SIGTRAP before running the new image.
    {
        let mut pt = thread.ptrace.lock();
        if pt.is_traced() {
            pt.stop(super::signal::SIGTRAP);
            if let Some(parent) = table::get_process(process.parent_pid()) {
                parent.wait_q.wake_all();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF64 with one PT_LOAD RX segment at 0x40_0000.
    fn tiny_elf() -> Vec<u8> {
        let mut image = alloc::vec![0u8; 0x1000];
        image[..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = 1; // little endian
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[24..32].copy_from_slice(&0x40_0100u64.to_le_bytes()); // entry
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&0u64.to_le_bytes()); // offset
        image[ph + 16..ph + 24].copy_from_slice(&0x40_0000u64.to_le_bytes()); // vaddr
        image[ph + 32..ph + 40].copy_from_slice(&0x200u64.to_le_bytes()); // filesz
        image[ph + 40..ph + 48].copy_from_slice(&0x400u64.to_le_bytes()); // memsz
        image
    }

    #[test]
    fn parses_a_minimal_executable() {
        let parsed = parse_elf(&tiny_elf()).unwrap();
        assert_eq!(parsed.entry, 0x40_0100);
        assert_eq!(parsed.segments.len(), 1);
        let seg = parsed.segments[0];
        assert_eq!(seg.vaddr, 0x40_0000);
        assert_eq!(seg.prot, Prot::READ | Prot::EXEC);
        assert_eq!(seg.mem_size, 0x400);
    }

    #[test]
    fn rejects_non_elf_images() {
        assert_eq!(parse_elf(b"#!/bin/sh\n").err(), Some(KernelError::Invalid));
        assert_eq!(parse_elf(&[]).err(), Some(KernelError::Invalid));
        let mut bad_class = tiny_elf();
        bad_class[4] = 1; // ELFCLASS32
        assert_eq!(parse_elf(&bad_class).err(), Some(KernelError::Invalid));
    }

    #[test]
    fn writable_segments_lose_execute() {
        let mut image = tiny_elf();
        let ph = 64;
        image[ph + 4..ph + 8].copy_from_slice(&(PF_R | PF_W | PF_X).to_le_bytes());
        let parsed = parse_elf(&image).unwrap();
        assert_eq!(parsed.segments[0].prot, Prot::READ | Prot::WRITE);
    }

    #[test]
    fn marshal_stack_layout() {
        let _g = crate::mm::space::test_support::lock();
        let space = AddressSpace::new().unwrap();
        space
            .map(
                STACK_TOP - STACK_SIZE as u64,
                0,
                STACK_SIZE,
                Prot::READ | Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
                None,
            )
            .unwrap();
        let argv = alloc::vec![String::from("init"), String::from("-s")];
        let envp = alloc::vec![String::from("TERM=vt100")];
        let sp = marshal_stack(&space, &argv, &envp).unwrap();
        assert_eq!(sp % 16, 0);
        assert!(sp < STACK_TOP);
        // argc + argv[2] + NULL + envp[1] + NULL = 6 words above sp.
        assert!(STACK_TOP - sp >= 6 * 8);
    }
}
