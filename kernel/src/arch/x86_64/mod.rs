//! x86_64 architecture backend
//!
//! Trapframe layout and accessors, GDT selector constants, TLB and
//! interrupt intrinsics, the user page-table root management behind
//! [`vm`], and the APIC/PIC interrupt controllers.

pub mod apic;
pub mod entry;
pub mod pat;
pub mod pic;
pub mod vm;

use crate::error::{KernelError, KernelResult};

/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_SS: u16 = 0x10;
/// User data segment selector (RPL 3).
pub const USER_SS: u16 = 0x1B;
/// User code segment selector (RPL 3).
pub const USER_CS: u16 = 0x23;

/// RFLAGS interrupt-enable bit.
const RFLAGS_IF: u64 = 1 << 9;
/// RFLAGS reserved bit 1, always set.
const RFLAGS_RESERVED: u64 = 1 << 1;
/// RFLAGS IOPL field (bits 12-13).
const RFLAGS_IOPL: u64 = 3 << 12;
/// RFLAGS bits user code may control through sigreturn.
const RFLAGS_USER_MASK: u64 = 0xFFF; // CF..OF, DF, TF excluded above bit 11

/// Highest user-canonical address (exclusive).
const USER_ADDR_TOP: u64 = 0x0000_8000_0000_0000;

/// Number of CPUs the kernel supports (the shootdown mask is a u64).
pub const MAX_CPUS: usize = 64;

/// Saved register context at a privilege transition.
///
/// Pushed by the trap entry stubs in this order; the layout is ABI between
/// the assembly stubs and the dispatcher.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Trapframe {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Vector number, pushed by the per-vector stub.
    pub vector: u64,
    /// Hardware error code, or zero for vectors without one.
    pub error_code: u64,
    // Hardware-pushed interrupt frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Trapframe {
    /// Syscall number register (RAX by convention).
    pub fn syscall_number(&self) -> usize {
        self.rax as usize
    }

    /// The six syscall argument registers, System V order.
    pub fn syscall_args(&self) -> [usize; 6] {
        [
            self.rdi as usize,
            self.rsi as usize,
            self.rdx as usize,
            self.r10 as usize,
            self.r8 as usize,
            self.r9 as usize,
        ]
    }

    /// Write the syscall return value into the ABI return register.
    pub fn set_syscall_retval(&mut self, val: isize) {
        self.rax = val as u64;
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    pub fn set_instruction_pointer(&mut self, ip: u64) {
        self.rip = ip;
    }

    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    pub fn set_stack_pointer(&mut self, sp: u64) {
        self.rsp = sp;
    }

    pub fn frame_pointer(&self) -> u64 {
        self.rbp
    }

    /// First four integer argument registers, for thread bootstrap.
    pub fn set_argument(&mut self, idx: usize, val: u64) {
        match idx {
            0 => self.rdi = val,
            1 => self.rsi = val,
            2 => self.rdx = val,
            _ => self.rcx = val,
        }
    }

    /// Whether the frame came from user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Build the initial frame for a new user thread.
    pub fn new_user(entry: u64, stack: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack,
            cs: USER_CS as u64,
            ss: USER_SS as u64,
            rflags: RFLAGS_IF | RFLAGS_RESERVED,
            ..Default::default()
        }
    }

    /// Validate and sanitize a frame rebuilt from a user-provided signal
    /// frame. Segments are forced to the user selectors, the interrupt
    /// flag stays on, and IOPL cannot be escalated.
    pub fn validate_user_frame(&mut self) -> KernelResult<()> {
        if self.cs != USER_CS as u64 || self.ss != USER_SS as u64 {
            return Err(KernelError::Invalid);
        }
        if self.rip >= USER_ADDR_TOP {
            return Err(KernelError::Invalid);
        }
        if self.rflags & RFLAGS_IOPL != 0 {
            return Err(KernelError::Invalid);
        }
        self.rflags = (self.rflags & RFLAGS_USER_MASK) | RFLAGS_IF | RFLAGS_RESERVED;
        Ok(())
    }
}

/// FXSAVE area for x87/SSE state.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpuState([u8; 512]);

impl Default for FpuState {
    fn default() -> Self {
        Self([0; 512])
    }
}

impl FpuState {
    /// Save the current CPU FPU state into this blob.
    ///
    /// # Safety
    ///
    /// Bare metal only; requires CR4.OSFXSR set during bring-up.
    pub unsafe fn save(&mut self) {
        // SAFETY: the buffer is 512 bytes, 16-byte aligned per repr.
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) self.0.as_mut_ptr(), options(nostack));
        }
    }

    /// Restore this blob into the CPU FPU state.
    ///
    /// # Safety
    ///
    /// The blob must hold a state previously produced by [`save`](Self::save).
    pub unsafe fn load(&self) {
        // SAFETY: caller guarantees a well-formed fxsave image.
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) self.0.as_ptr(), options(nostack));
        }
    }
}

/// Invalidate one virtual address in the local TLB.
pub fn tlb_flush_address(vaddr: u64) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr));
    #[cfg(not(target_os = "none"))]
    let _ = vaddr;
}

/// Flush the entire local TLB (CR3 reload).
pub fn tlb_flush_all() {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush_all();
}

/// Disable maskable interrupts; returns whether they were enabled.
pub fn disable_interrupts() -> bool {
    #[cfg(target_os = "none")]
    {
        let were = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        were
    }
    #[cfg(not(target_os = "none"))]
    false
}

/// Enable maskable interrupts.
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

/// Halt until the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    x86_64::instructions::hlt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}

/// Identifier of the executing CPU (Local APIC ID).
pub fn cpu_id() -> usize {
    #[cfg(target_os = "none")]
    {
        apic::local_apic_id() as usize
    }
    #[cfg(not(target_os = "none"))]
    0
}

/// Send the reschedule IPI to `cpu`.
pub fn cpu_ipi(cpu: usize) {
    #[cfg(target_os = "none")]
    apic::send_ipi(cpu as u8, crate::irq::IPI_VECTOR);
    #[cfg(not(target_os = "none"))]
    let _ = cpu;
}

/// Kick a halted application processor via INIT/SIPI.
///
/// `entry_frame` is the frame index of the real-mode trampoline page.
pub fn start_smp_cpu(cpu: usize, entry_frame: u8) {
    #[cfg(target_os = "none")]
    apic::send_init_sipi(cpu as u8, entry_frame);
    #[cfg(not(target_os = "none"))]
    let _ = (cpu, entry_frame);
}
