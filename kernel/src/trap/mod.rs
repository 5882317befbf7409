//! Trap dispatching
//!
//! The per-architecture entry stubs save the full register set into the
//! current thread's trapframe and call [`dispatch`] with the vector id.
//! The decision tree: CPU exceptions become signals (or a kernel panic),
//! the syscall vector goes to the typed dispatch table, the IPI vector
//! consumes the reschedule flag, and everything else fans out to the IRQ
//! handler lists. On the way back to user mode, pending unmasked signals
//! are delivered onto the user stack.

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::{
    arch::Trapframe,
    error::{KernelError, KernelResult},
    mm::{self, user},
    process::{
        self, exit,
        process::Process,
        signal::{
            self, default_disposition, next_deliverable, sig_bit, AltStack, Disposition,
            SaFlags, SigHandler,
        },
        table,
        thread::Thread,
        wait,
    },
};

/// Classification of a trap vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapClass {
    /// Arithmetic fault delivering SIGFPE.
    ArithmeticError,
    /// Undefined instruction delivering SIGILL.
    InvalidOpcode,
    /// Debug / single-step / breakpoint.
    Debug,
    /// Page fault / data abort / instruction abort.
    PageFault,
    /// Protection or stack fault delivering SIGSEGV.
    Protection,
    /// Alignment check delivering SIGBUS.
    Alignment,
    /// The syscall gate.
    Syscall,
    /// Reschedule IPI.
    Ipi,
    /// Spurious interrupt, acknowledged and dropped.
    Spurious,
    /// Device vector for the IRQ router.
    Device,
    /// Exception the kernel has no mapping for.
    Unknown,
}

/// Classify an x86_64 vector.
#[cfg(target_arch = "x86_64")]
pub fn classify(vector: u32) -> TrapClass {
    match vector {
        0 | 16 | 19 => TrapClass::ArithmeticError,
        6 => TrapClass::InvalidOpcode,
        1 | 3 => TrapClass::Debug,
        14 => TrapClass::PageFault,
        12 | 13 => TrapClass::Protection,
        17 => TrapClass::Alignment,
        2..=31 => TrapClass::Unknown,
        v if v == crate::irq::SYSCALL_VECTOR => TrapClass::Syscall,
        v if v == crate::irq::IPI_VECTOR as u32 => TrapClass::Ipi,
        v if v == crate::irq::SPURIOUS_VECTOR => TrapClass::Spurious,
        _ => TrapClass::Device,
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn classify(vector: u32) -> TrapClass {
    match vector {
        v if v == crate::irq::IPI_VECTOR as u32 => TrapClass::Ipi,
        v if v == crate::irq::SPURIOUS_VECTOR => TrapClass::Spurious,
        _ => TrapClass::Device,
    }
}

/// Signal a trap converts into, by class.
fn trap_signal(class: TrapClass) -> u8 {
    match class {
        TrapClass::ArithmeticError => signal::SIGFPE,
        TrapClass::InvalidOpcode => signal::SIGILL,
        TrapClass::Debug => signal::SIGTRAP,
        TrapClass::Alignment => signal::SIGBUS,
        _ => signal::SIGSEGV,
    }
}

/// The common dispatcher called from the architecture entry stubs.
///
/// `fault_addr` carries CR2/FAR/stval for page faults and zero otherwise.
pub fn dispatch(vector: u32, tf: &mut Trapframe, fault_addr: u64) {
    let class = classify(vector);
    match class {
        TrapClass::Syscall => {
            handle_syscall(tf);
        }
        TrapClass::Ipi => {
            if crate::sched::this_cpu().take_must_resched() {
                crate::sched::yield_cpu();
            }
        }
        TrapClass::Spurious => {}
        TrapClass::Device => {
            crate::irq::dispatch(crate::arch::cpu_id(), vector);
        }
        TrapClass::PageFault => {
            handle_fault(tf, fault_addr);
        }
        _ => {
            handle_exception(class, tf, fault_addr);
        }
    }
    // Every kernel-to-user boundary checks for deliverable signals, and
    // a tracee left in a stop (e.g. the post-exec SIGTRAP) parks here.
    if tf.from_user() {
        if let (Some(thread), Some(proc_)) = (table::current_thread(), table::current_process()) {
            deliver_pending(&proc_, &thread, tf);
            ptrace_park(&thread);
        }
    }
}

fn handle_fault(tf: &mut Trapframe, fault_addr: u64) {
    #[cfg(target_arch = "x86_64")]
    let info = mm::fault::from_x86_64(tf.error_code, fault_addr, tf.instruction_pointer());
    #[cfg(not(target_arch = "x86_64"))]
    let info = mm::PageFaultInfo {
        address: fault_addr,
        reason: mm::PageFaultReason::NotPresent,
        access: mm::Access::Read,
        from_user: tf.from_user(),
        instruction_pointer: tf.instruction_pointer(),
    };

    let resolved = table::current_process()
        .map(|p| {
            let space = p.space.lock().clone();
            mm::handle_page_fault(&space, &info)
        })
        .unwrap_or(Err(KernelError::BadAddress {
            addr: fault_addr as usize,
        }));

    if resolved.is_err() {
        if tf.from_user() {
            if let Some(thread) = table::current_thread() {
                thread.post_signal(signal::SIGSEGV);
                return;
            }
        }
        panic!(
            "unhandled kernel page fault at {:#x}\n{:#x?}",
            fault_addr, tf
        );
    }
}

fn handle_exception(class: TrapClass, tf: &mut Trapframe, fault_addr: u64) {
    if !tf.from_user() {
        panic!(
            "fatal kernel exception {:?} (fault addr {:#x})\n{:#x?}",
            class, fault_addr, tf
        );
    }
    let sig = trap_signal(class);
    if class == TrapClass::Debug {
        // A single-stepping tracee stops and its tracer is notified
        // through wait4; an untraced debug trap is a plain SIGTRAP.
        if let Some(thread) = table::current_thread() {
            let mut pt = thread.ptrace.lock();
            if pt.wants_singlestep() {
                pt.stop(signal::SIGTRAP);
                drop(pt);
                notify_tracer(&thread);
                ptrace_park(&thread);
                return;
            }
        }
    }
    if let Some(thread) = table::current_thread() {
        thread.post_signal(sig);
    }
}

/// Wake the tracer's wait queue after a tracee stop.
fn notify_tracer(thread: &Arc<Thread>) {
    let tracer_pid = thread.ptrace.lock().tracer;
    if let Some(tracer) = table::get_process(tracer_pid) {
        tracer.wait_q.wake_all();
    }
}

/// Park a stopped tracee until the tracer issues a resume request.
fn ptrace_park(thread: &Arc<Thread>) {
    #[cfg(target_os = "none")]
    while thread.ptrace.lock().state == process::ptrace::PtraceState::Stopped {
        crate::sched::yield_cpu();
    }
    #[cfg(not(target_os = "none"))]
    let _ = thread;
}

fn handle_syscall(tf: &mut Trapframe) {
    let (thread, proc_) = match (table::current_thread(), table::current_process()) {
        (Some(t), Some(p)) => (t, p),
        _ => {
            tf.set_syscall_retval(KernelError::NoProcess.to_retval());
            return;
        }
    };

    // Syscall-enter stop for PTRACE_ST_SYSCALL tracees.
    let traced = {
        let mut pt = thread.ptrace.lock();
        if pt.wants_syscall_stops() {
            pt.stop(signal::SIGTRAP);
            pt.in_syscall_stop = true;
            true
        } else {
            false
        }
    };
    if traced {
        notify_tracer(&thread);
        ptrace_park(&thread);
    }

    let number = tf.syscall_number();
    let args = tf.syscall_args();
    let ret = crate::syscall::dispatch(&proc_, &thread, number, args, tf);
    tf.set_syscall_retval(ret);
    thread.add_cpu_ticks(1);
    proc_.rusage.lock().system_ticks += 1;

    // Syscall-exit stop.
    let traced_exit = {
        let mut pt = thread.ptrace.lock();
        if pt.in_syscall_stop {
            pt.in_syscall_stop = false;
            if pt.state == process::ptrace::PtraceState::Syscall {
                pt.stop(signal::SIGTRAP);
                true
            } else {
                false
            }
        } else {
            false
        }
    };
    if traced_exit {
        notify_tracer(&thread);
        ptrace_park(&thread);
    }
}

// ---------------------------------------------------------------------------
// Signal delivery
// ---------------------------------------------------------------------------

/// Magic tag validating a signal frame at sigreturn.
const SIGFRAME_MAGIC: u64 = 0x5649_4753_4652_414D; // "VIGSFRAM"

/// The frame pushed onto the user stack for a handler invocation.
#[repr(C)]
#[derive(Clone, Copy)]
struct SignalFrame {
    magic: u64,
    sig: u64,
    on_altstack: u64,
    saved_mask: u64,
    saved_tf: Trapframe,
}

impl SignalFrame {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: SignalFrame is repr(C) plain data.
        unsafe {
            core::slice::from_raw_parts(
                self as *const _ as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// Deliver the next pending, unmasked signal, if any.
///
/// Handlers get a frame on the chosen stack and the PC redirected; the
/// default dispositions terminate, stop, or continue the process.
pub fn deliver_pending(proc_: &Arc<Process>, thread: &Arc<Thread>, tf: &mut Trapframe) {
    loop {
        let pending =
            thread.pending.load(Ordering::SeqCst) | proc_.pending.load(Ordering::SeqCst);
        let Some(sig) = next_deliverable(pending, thread.sigmask()) else {
            return;
        };
        thread.take_signal(sig);
        proc_.take_signal(sig);

        let action = proc_.actions.lock().get(sig).unwrap_or_default();
        match action.handler {
            SigHandler::Ignore => continue,
            SigHandler::Default => match default_disposition(sig) {
                Disposition::Ignore | Disposition::Continue => continue,
                Disposition::Stop => {
                    process::deliver_to_process(proc_, signal::SIGSTOP);
                    continue;
                }
                Disposition::Terminate | Disposition::Core => {
                    exit::exit_thread(proc_, thread.tid, wait::signaled_status(sig));
                    return;
                }
            },
            SigHandler::Handler(entry) => {
                if push_signal_frame(proc_, thread, tf, sig, entry, &action).is_err() {
                    // An unwritable stack turns the delivery into a kill.
                    exit::exit_thread(
                        proc_,
                        thread.tid,
                        wait::signaled_status(signal::SIGSEGV),
                    );
                }
                return;
            }
        }
    }
}

/// Build the user-stack frame and redirect the trapframe into the
/// handler, with the sigreturn trampoline as its return address.
fn push_signal_frame(
    proc_: &Arc<Process>,
    thread: &Arc<Thread>,
    tf: &mut Trapframe,
    sig: u8,
    entry: u64,
    action: &signal::SigAction,
) -> KernelResult<()> {
    let old_mask = thread.sigmask();

    // Stack selection: the alternate stack applies when requested and we
    // are not already running on it (tracked by the nesting counter).
    let mut on_altstack = false;
    let sp_base = {
        let mut ss = thread.altstack.lock();
        if action.flags.contains(SaFlags::ONSTACK) && ss.size != 0 && ss.nesting == 0 {
            ss.nesting += 1;
            on_altstack = true;
            ss.top()
        } else if ss.contains(tf.stack_pointer()) {
            ss.nesting += 1;
            on_altstack = true;
            tf.stack_pointer()
        } else {
            tf.stack_pointer()
        }
    };

    let frame = SignalFrame {
        magic: SIGFRAME_MAGIC,
        sig: sig as u64,
        on_altstack: on_altstack as u64,
        saved_mask: old_mask,
        saved_tf: *tf,
    };

    // Frame below a 128-byte red zone, 16-byte aligned, with the
    // trampoline return address right below it.
    let frame_size = core::mem::size_of::<SignalFrame>() as u64;
    let mut frame_addr = (sp_base - 128 - frame_size) & !0xF;
    let space = proc_.space.lock().clone();
    user::copyout(&space, frame_addr, frame.as_bytes())?;
    frame_addr -= 8;
    user::copyout(&space, frame_addr, &sigreturn_trampoline().to_le_bytes())?;

    // Handler's mask: the action mask plus the signal itself unless
    // NODEFER.
    let mut new_mask = old_mask | action.mask;
    if !action.flags.contains(SaFlags::NODEFER) {
        new_mask |= sig_bit(sig);
    }
    thread.set_sigmask(new_mask);

    if action.flags.contains(SaFlags::RESETHAND) {
        let _ = proc_.actions.lock().set(sig, signal::SigAction::default());
    }

    tf.set_stack_pointer(frame_addr);
    tf.set_instruction_pointer(entry);
    tf.set_argument(0, sig as u64);
    Ok(())
}

/// Address of the sigreturn trampoline page mapped into every process.
pub fn sigreturn_trampoline() -> u64 {
    0x0000_7FFF_FF60_0000
}

/// The sigreturn syscall: rebuild the trapframe from the user frame.
///
/// The saved frame is validated before installation: segments, privilege
/// bits, and the interrupt flag cannot be escalated. The signal mask is
/// restored, and the alternate-stack nesting counter drops if delivery
/// had switched stacks.
pub fn sigreturn(proc_: &Arc<Process>, thread: &Arc<Thread>, tf: &mut Trapframe) -> KernelResult<()> {
    // The trampoline return left sp at the frame start.
    let frame_addr = tf.stack_pointer() + 8;
    let space = proc_.space.lock().clone();
    let mut raw = [0u8; core::mem::size_of::<SignalFrame>()];
    user::copyin(&space, frame_addr, &mut raw)?;
    // SAFETY: SignalFrame is repr(C) plain data of exactly this size.
    let frame: SignalFrame = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const _) };

    if frame.magic != SIGFRAME_MAGIC {
        return Err(KernelError::Invalid);
    }
    let mut restored = frame.saved_tf;
    restored.validate_user_frame()?;

    thread.set_sigmask(frame.saved_mask);
    if frame.on_altstack != 0 {
        let mut ss = thread.altstack.lock();
        ss.nesting = ss.nesting.saturating_sub(1);
    }
    *tf = restored;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{space::test_support, AddressSpace, MapFlags, Prot, PAGE_SIZE};
    use crate::process::signal::{SigAction, SIGINT};
    use alloc::string::String;

    fn spawn_with_stack() -> (Arc<Process>, Arc<Thread>, u64) {
        let pid = crate::process::table::alloc_id();
        let space = Arc::new(AddressSpace::new().unwrap());
        let stack_base = space
            .map(
                0,
                0,
                16 * PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
            )
            .unwrap();
        let proc_ = Arc::new(Process::new(pid, 0, String::from("sig"), space));
        let thread = Arc::new(Thread::new(pid, pid, 4));
        proc_.threads.lock().push(pid);
        table::insert_process(proc_.clone());
        table::insert_thread(thread.clone());
        (proc_, thread, stack_base + 15 * PAGE_SIZE as u64)
    }

    fn cleanup(pid: u64) {
        table::remove_process(pid);
        table::remove_thread(pid);
    }

    #[test]
    fn classification_covers_the_exception_range() {
        #[cfg(target_arch = "x86_64")]
        {
            assert_eq!(classify(0), TrapClass::ArithmeticError);
            assert_eq!(classify(6), TrapClass::InvalidOpcode);
            assert_eq!(classify(14), TrapClass::PageFault);
            assert_eq!(classify(13), TrapClass::Protection);
            assert_eq!(classify(0x80), TrapClass::Syscall);
            assert_eq!(classify(0xFD), TrapClass::Ipi);
            assert_eq!(classify(0xFF), TrapClass::Spurious);
            assert_eq!(classify(0x21), TrapClass::Device);
        }
    }

    #[test]
    fn trap_signals_match_posix() {
        assert_eq!(trap_signal(TrapClass::ArithmeticError), signal::SIGFPE);
        assert_eq!(trap_signal(TrapClass::InvalidOpcode), signal::SIGILL);
        assert_eq!(trap_signal(TrapClass::Protection), signal::SIGSEGV);
        assert_eq!(trap_signal(TrapClass::Alignment), signal::SIGBUS);
    }

    #[test]
    fn handler_delivery_redirects_into_the_handler() {
        let _g = test_support::lock();
        let (proc_, thread, sp) = spawn_with_stack();
        proc_
            .actions
            .lock()
            .set(
                SIGINT,
                SigAction {
                    handler: SigHandler::Handler(0x41_0000),
                    mask: 0,
                    flags: SaFlags::empty(),
                },
            )
            .unwrap();
        thread.post_signal(SIGINT);

        let mut tf = Trapframe::new_user(0x40_0000, sp);
        deliver_pending(&proc_, &thread, &mut tf);
        assert_eq!(tf.instruction_pointer(), 0x41_0000);
        assert!(tf.stack_pointer() < sp);
        // The delivered signal is now masked.
        assert_ne!(thread.sigmask() & sig_bit(SIGINT), 0);
        // Pending bit consumed.
        assert_eq!(thread.pending.load(Ordering::SeqCst) & sig_bit(SIGINT), 0);
        cleanup(proc_.pid);
    }

    #[test]
    fn altstack_delivery_switches_stacks() {
        let _g = test_support::lock();
        let (proc_, thread, sp) = spawn_with_stack();
        // Carve an alternate stack inside the mapped range.
        let alt_base = sp - 8 * PAGE_SIZE as u64;
        *thread.altstack.lock() = AltStack {
            base: alt_base,
            size: 4 * PAGE_SIZE,
            nesting: 0,
        };
        proc_
            .actions
            .lock()
            .set(
                SIGINT,
                SigAction {
                    handler: SigHandler::Handler(0x41_0000),
                    mask: 0,
                    flags: SaFlags::ONSTACK,
                },
            )
            .unwrap();
        thread.post_signal(SIGINT);

        let mut tf = Trapframe::new_user(0x40_0000, sp);
        deliver_pending(&proc_, &thread, &mut tf);
        let handler_sp = tf.stack_pointer();
        assert!(handler_sp >= alt_base && handler_sp < alt_base + 4 * PAGE_SIZE as u64);
        assert_eq!(thread.altstack.lock().nesting, 1);
        cleanup(proc_.pid);
    }

    #[test]
    fn ignored_and_default_ignored_signals_are_consumed() {
        let _g = test_support::lock();
        let (proc_, thread, sp) = spawn_with_stack();
        // SIGCHLD default-ignores.
        thread.post_signal(signal::SIGCHLD);
        let mut tf = Trapframe::new_user(0x40_0000, sp);
        deliver_pending(&proc_, &thread, &mut tf);
        assert_eq!(tf.instruction_pointer(), 0x40_0000);
        assert_eq!(thread.pending.load(Ordering::SeqCst), 0);
        cleanup(proc_.pid);
    }

    #[test]
    fn sigreturn_rejects_a_forged_frame() {
        let _g = test_support::lock();
        let (proc_, thread, sp) = spawn_with_stack();
        // Host copyin reads zeroed pages: the magic check must fail.
        let mut tf = Trapframe::new_user(0x40_0000, sp - 4096);
        assert_eq!(
            sigreturn(&proc_, &thread, &mut tf).err(),
            Some(KernelError::Invalid)
        );
        cleanup(proc_.pid);
    }

    #[test]
    fn masked_signal_stays_pending() {
        let _g = test_support::lock();
        let (proc_, thread, sp) = spawn_with_stack();
        proc_
            .actions
            .lock()
            .set(
                SIGINT,
                SigAction {
                    handler: SigHandler::Handler(0x41_0000),
                    mask: 0,
                    flags: SaFlags::empty(),
                },
            )
            .unwrap();
        thread.set_sigmask(sig_bit(SIGINT));
        thread.post_signal(SIGINT);
        let mut tf = Trapframe::new_user(0x40_0000, sp);
        deliver_pending(&proc_, &thread, &mut tf);
        // Not delivered, still pending.
        assert_eq!(tf.instruction_pointer(), 0x40_0000);
        assert_ne!(thread.pending.load(Ordering::SeqCst) & sig_bit(SIGINT), 0);
        cleanup(proc_.pid);
    }
}
