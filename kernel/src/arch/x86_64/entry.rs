//! Trap entry stubs and IDT (x86_64)
//!
//! One stub per vector pushes a dummy error code where the CPU does not,
//! then the vector number, and falls into the common save path. The save
//! order mirrors the [`Trapframe`](super::Trapframe) field layout exactly,
//! so the common dispatcher receives `&mut Trapframe` pointing at the
//! stack image.

#![cfg(all(target_arch = "x86_64", target_os = "none"))]

use core::sync::atomic::{AtomicU64, Ordering};

use super::Trapframe;

// Vectors 8, 10-14, 17, 21 push a hardware error code; everything else
// gets a zero pushed by its stub so the frame layout is uniform. The
// vector and error code sit between the interrupt frame and the general
// registers; pushing rax..r15 completes the Trapframe image with r15 at
// the lowest address.
core::arch::global_asm!(
    ".macro TRAP_STUB n",
    ".balign 16",
    "trap_stub_\\n:",
    ".if !(\\n == 8 || \\n == 10 || \\n == 11 || \\n == 12 || \\n == 13 || \\n == 14 || \\n == 17 || \\n == 21)",
    "    push 0",
    ".endif",
    "    push \\n",
    "    jmp trap_common",
    ".endm",
    ".altmacro",
    ".set i, 0",
    ".rept 256",
    "    TRAP_STUB %i",
    "    .set i, i+1",
    ".endr",
    ".balign 16",
    "trap_common:",
    "    push rax",
    "    push rbx",
    "    push rcx",
    "    push rdx",
    "    push rsi",
    "    push rdi",
    "    push rbp",
    "    push r8",
    "    push r9",
    "    push r10",
    "    push r11",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov rdi, rsp",
    "    call {handler}",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop r11",
    "    pop r10",
    "    pop r9",
    "    pop r8",
    "    pop rbp",
    "    pop rdi",
    "    pop rsi",
    "    pop rdx",
    "    pop rcx",
    "    pop rbx",
    "    pop rax",
    "    add rsp, 16",
    "    iretq",
    ".balign 16",
    ".global trap_stub_table",
    "trap_stub_table:",
    ".set i, 0",
    ".rept 256",
    "    .quad trap_stub_%i",
    "    .set i, i+1",
    ".endr",
    handler = sym trap_entry,
);

extern "C" {
    static trap_stub_table: [u64; 256];
}

/// Rust side of the entry path: copy fault state and call the common
/// dispatcher.
#[no_mangle]
extern "C" fn trap_entry(tf: &mut Trapframe) {
    let vector = tf.vector as u32;
    let fault_addr = if vector == 14 {
        x86_64::registers::control::Cr2::read_raw()
    } else {
        0
    };
    crate::trap::dispatch(vector, tf, fault_addr);
}

/// A 16-byte IDT gate descriptor.
#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            options: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, dpl: u16) {
        self.offset_low = handler as u16;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_high = (handler >> 32) as u32;
        self.selector = super::KERNEL_CS;
        // Present, 64-bit interrupt gate, requested privilege level.
        self.options = 0x8E00 | (dpl << 13);
    }
}

#[repr(C, align(16))]
struct Idt([IdtEntry; 256]);

static IDT_STORAGE: spin::Mutex<Idt> = spin::Mutex::new(Idt([IdtEntry::missing(); 256]));
static IDT_ADDR: AtomicU64 = AtomicU64::new(0);

/// Build and load the IDT on the executing CPU.
///
/// The syscall gate is reachable from ring 3; everything else is
/// kernel-only.
pub fn init_idt() {
    let mut idt = IDT_STORAGE.lock();
    // SAFETY: the stub table is generated alongside the stubs above.
    let stubs = unsafe { &trap_stub_table };
    for (vector, entry) in idt.0.iter_mut().enumerate() {
        let dpl = if vector as u32 == crate::irq::SYSCALL_VECTOR {
            3
        } else {
            0
        };
        entry.set(stubs[vector], dpl);
    }
    let base = idt.0.as_ptr() as u64;
    IDT_ADDR.store(base, Ordering::Release);
    let descriptor = x86_64::structures::DescriptorTablePointer {
        limit: (core::mem::size_of::<Idt>() - 1) as u16,
        base: x86_64::VirtAddr::new(base),
    };
    // SAFETY: the table lives in a static and is never moved; the mutex
    // guard only protects construction, the CPU reads it lock-free.
    unsafe {
        x86_64::instructions::tables::lidt(&descriptor);
    }
}
