//! System-call surface
//!
//! Fixed-numbered dispatch through a table of `(number, name, handler)`
//! entries. Arguments arrive in the architecture's calling-convention
//! registers (already extracted into the context); results return through
//! the ABI return register, with errors encoded as `-errno` in
//! `[-4095, -1]`. User pointers only ever cross through the copy
//! primitives in [`crate::mm::user`].

#[cfg(feature = "alloc")]
extern crate alloc;

use alloc::sync::Arc;

use crate::{
    arch::Trapframe,
    error::{KernelError, KernelResult},
    process::{process::Process, thread::Thread},
};

mod fd;
mod futex;
mod info;
mod memory;
mod net;
mod poll;
mod proc;
mod signal;

// Process control.
pub const NR_EXIT: usize = 1;
pub const NR_EXIT_GROUP: usize = 2;
pub const NR_CLONE: usize = 3;
pub const NR_EXECVEAT: usize = 4;
pub const NR_WAIT4: usize = 5;
pub const NR_GETPID: usize = 6;
pub const NR_GETPPID: usize = 7;
pub const NR_GETTID: usize = 8;
pub const NR_SCHED_YIELD: usize = 9;
pub const NR_NANOSLEEP: usize = 10;
pub const NR_KILL: usize = 11;
pub const NR_PTRACE: usize = 12;
pub const NR_GETTLS: usize = 13;
pub const NR_SETTLS: usize = 14;
pub const NR_SETPGID: usize = 15;
pub const NR_GETPGID: usize = 16;
pub const NR_GETPGRP: usize = 17;
pub const NR_SETSID: usize = 18;
pub const NR_GETSID: usize = 19;

// Credentials.
pub const NR_GETUID: usize = 20;
pub const NR_GETEUID: usize = 21;
pub const NR_GETGID: usize = 22;
pub const NR_GETEGID: usize = 23;
pub const NR_SETUID: usize = 24;
pub const NR_SETGID: usize = 25;
pub const NR_SETREUID: usize = 26;
pub const NR_SETREGID: usize = 27;
pub const NR_GETGROUPS: usize = 28;
pub const NR_SETGROUPS: usize = 29;

// Files.
pub const NR_OPENAT: usize = 30;
pub const NR_CLOSE: usize = 31;
pub const NR_READV: usize = 32;
pub const NR_WRITEV: usize = 33;
pub const NR_LSEEK: usize = 34;
pub const NR_DUP: usize = 35;
pub const NR_DUP3: usize = 36;
pub const NR_FCNTL: usize = 37;
pub const NR_IOCTL: usize = 38;
pub const NR_GETDENTS: usize = 39;
pub const NR_PIPE2: usize = 40;
pub const NR_CHDIR: usize = 41;
pub const NR_FCHDIR: usize = 42;
pub const NR_CHROOT: usize = 43;
pub const NR_UNLINKAT: usize = 44;
pub const NR_MKNODAT: usize = 45;
pub const NR_FACCESSAT: usize = 46;
pub const NR_FSTATAT: usize = 47;
pub const NR_LINKAT: usize = 48;
pub const NR_SYMLINKAT: usize = 49;
pub const NR_READLINKAT: usize = 50;
pub const NR_RENAMEAT: usize = 51;
pub const NR_FTRUNCATEAT: usize = 52;
pub const NR_FCHMODAT: usize = 53;
pub const NR_FCHOWNAT: usize = 54;
pub const NR_UTIMENSAT: usize = 55;
pub const NR_FSYNC: usize = 56;
pub const NR_FDATASYNC: usize = 57;
pub const NR_FSTATVFSAT: usize = 58;
pub const NR_MOUNT: usize = 59;

// Memory.
pub const NR_MMAP: usize = 60;
pub const NR_MUNMAP: usize = 61;
pub const NR_MPROTECT: usize = 62;
pub const NR_MADVISE: usize = 63;
pub const NR_MSYNC: usize = 64;
pub const NR_GETPAGESIZE: usize = 65;

// Signals.
pub const NR_SIGACTION: usize = 70;
pub const NR_SIGPROCMASK: usize = 71;
pub const NR_SIGPENDING: usize = 72;
pub const NR_SIGSUSPEND: usize = 73;
pub const NR_SIGALTSTACK: usize = 74;
pub const NR_SIGRETURN: usize = 75;

// Polling and futexes.
pub const NR_PPOLL: usize = 80;
pub const NR_PSELECT: usize = 81;
pub const NR_FUTEX: usize = 82;

// Time and accounting.
pub const NR_TIME: usize = 90;
pub const NR_CLOCK_GETTIME: usize = 91;
pub const NR_CLOCK_SETTIME: usize = 92;
pub const NR_CLOCK_GETRES: usize = 93;
pub const NR_TIMES: usize = 94;
pub const NR_GETRUSAGE: usize = 95;
pub const NR_GETRLIMIT: usize = 96;
pub const NR_SETRLIMIT: usize = 97;
pub const NR_GETPRIORITY: usize = 98;
pub const NR_SETPRIORITY: usize = 99;
pub const NR_UMASK: usize = 100;
pub const NR_UNAME: usize = 101;

// Sockets.
pub const NR_SOCKET: usize = 110;
pub const NR_SOCKETPAIR: usize = 111;
pub const NR_BIND: usize = 112;
pub const NR_CONNECT: usize = 113;
pub const NR_LISTEN: usize = 114;
pub const NR_ACCEPT: usize = 115;
pub const NR_GETSOCKNAME: usize = 116;
pub const NR_GETPEERNAME: usize = 117;
pub const NR_GETSOCKOPT: usize = 118;
pub const NR_SETSOCKOPT: usize = 119;
pub const NR_SENDMSG: usize = 120;
pub const NR_RECVMSG: usize = 121;
pub const NR_SHUTDOWN: usize = 122;

// Platform.
pub const NR_REBOOT: usize = 125;
pub const NR_KMLOAD: usize = 126;
pub const NR_KMUNLOAD: usize = 127;

/// Everything a handler needs: the calling thread, its process, the raw
/// argument registers, and the trapframe (sigreturn and clone rewrite
/// it).
pub struct SyscallCtx<'a> {
    pub proc_: &'a Arc<Process>,
    pub thread: &'a Arc<Thread>,
    pub args: [usize; 6],
    pub tf: &'a mut Trapframe,
}

impl SyscallCtx<'_> {
    /// The caller's address space.
    pub fn space(&self) -> Arc<crate::mm::AddressSpace> {
        self.proc_.space.lock().clone()
    }
}

type SyscallFn = fn(&mut SyscallCtx) -> KernelResult<usize>;

/// The dispatch table: `(number, name, handler)`.
static SYSCALL_TABLE: &[(usize, &str, SyscallFn)] = &[
    (NR_EXIT, "exit", proc::sys_exit),
    (NR_EXIT_GROUP, "exit_group", proc::sys_exit_group),
    (NR_CLONE, "clone", proc::sys_clone),
    (NR_EXECVEAT, "execveat", proc::sys_execveat),
    (NR_WAIT4, "wait4", proc::sys_wait4),
    (NR_GETPID, "getpid", proc::sys_getpid),
    (NR_GETPPID, "getppid", proc::sys_getppid),
    (NR_GETTID, "gettid", proc::sys_gettid),
    (NR_SCHED_YIELD, "sched_yield", proc::sys_sched_yield),
    (NR_NANOSLEEP, "nanosleep", proc::sys_nanosleep),
    (NR_KILL, "kill", proc::sys_kill),
    (NR_PTRACE, "ptrace", proc::sys_ptrace),
    (NR_GETTLS, "gettls", proc::sys_gettls),
    (NR_SETTLS, "settls", proc::sys_settls),
    (NR_SETPGID, "setpgid", proc::sys_setpgid),
    (NR_GETPGID, "getpgid", proc::sys_getpgid),
    (NR_GETPGRP, "getpgrp", proc::sys_getpgrp),
    (NR_SETSID, "setsid", proc::sys_setsid),
    (NR_GETSID, "getsid", proc::sys_getsid),
    (NR_GETUID, "getuid", proc::sys_getuid),
    (NR_GETEUID, "geteuid", proc::sys_geteuid),
    (NR_GETGID, "getgid", proc::sys_getgid),
    (NR_GETEGID, "getegid", proc::sys_getegid),
    (NR_SETUID, "setuid", proc::sys_setuid),
    (NR_SETGID, "setgid", proc::sys_setgid),
    (NR_SETREUID, "setreuid", proc::sys_setreuid),
    (NR_SETREGID, "setregid", proc::sys_setregid),
    (NR_GETGROUPS, "getgroups", proc::sys_getgroups),
    (NR_SETGROUPS, "setgroups", proc::sys_setgroups),
    (NR_OPENAT, "openat", fd::sys_openat),
    (NR_CLOSE, "close", fd::sys_close),
    (NR_READV, "readv", fd::sys_readv),
    (NR_WRITEV, "writev", fd::sys_writev),
    (NR_LSEEK, "lseek", fd::sys_lseek),
    (NR_DUP, "dup", fd::sys_dup),
    (NR_DUP3, "dup3", fd::sys_dup3),
    (NR_FCNTL, "fcntl", fd::sys_fcntl),
    (NR_IOCTL, "ioctl", fd::sys_ioctl),
    (NR_GETDENTS, "getdents", fd::sys_getdents),
    (NR_PIPE2, "pipe2", fd::sys_pipe2),
    (NR_CHDIR, "chdir", fd::sys_chdir),
    (NR_FCHDIR, "fchdir", fd::sys_fchdir),
    (NR_CHROOT, "chroot", fd::sys_chroot),
    (NR_UNLINKAT, "unlinkat", fd::sys_unlinkat),
    (NR_MKNODAT, "mknodat", fd::sys_mknodat),
    (NR_FACCESSAT, "faccessat", fd::sys_faccessat),
    (NR_FSTATAT, "fstatat", fd::sys_fstatat),
    (NR_LINKAT, "linkat", fd::sys_linkat),
    (NR_SYMLINKAT, "symlinkat", fd::sys_symlinkat),
    (NR_READLINKAT, "readlinkat", fd::sys_readlinkat),
    (NR_RENAMEAT, "renameat", fd::sys_renameat),
    (NR_FTRUNCATEAT, "ftruncateat", fd::sys_ftruncateat),
    (NR_FCHMODAT, "fchmodat", fd::sys_fchmodat),
    (NR_FCHOWNAT, "fchownat", fd::sys_fchownat),
    (NR_UTIMENSAT, "utimensat", fd::sys_utimensat),
    (NR_FSYNC, "fsync", fd::sys_fsync),
    (NR_FDATASYNC, "fdatasync", fd::sys_fdatasync),
    (NR_FSTATVFSAT, "fstatvfsat", fd::sys_fstatvfsat),
    (NR_MOUNT, "mount", fd::sys_mount),
    (NR_MMAP, "mmap", memory::sys_mmap),
    (NR_MUNMAP, "munmap", memory::sys_munmap),
    (NR_MPROTECT, "mprotect", memory::sys_mprotect),
    (NR_MADVISE, "madvise", memory::sys_madvise),
    (NR_MSYNC, "msync", memory::sys_msync),
    (NR_GETPAGESIZE, "getpagesize", memory::sys_getpagesize),
    (NR_SIGACTION, "sigaction", signal::sys_sigaction),
    (NR_SIGPROCMASK, "sigprocmask", signal::sys_sigprocmask),
    (NR_SIGPENDING, "sigpending", signal::sys_sigpending),
    (NR_SIGSUSPEND, "sigsuspend", signal::sys_sigsuspend),
    (NR_SIGALTSTACK, "sigaltstack", signal::sys_sigaltstack),
    (NR_SIGRETURN, "sigreturn", signal::sys_sigreturn),
    (NR_PPOLL, "ppoll", poll::sys_ppoll),
    (NR_PSELECT, "pselect", poll::sys_pselect),
    (NR_FUTEX, "futex", futex::sys_futex),
    (NR_TIME, "time", info::sys_time),
    (NR_CLOCK_GETTIME, "clock_gettime", info::sys_clock_gettime),
    (NR_CLOCK_SETTIME, "clock_settime", info::sys_clock_settime),
    (NR_CLOCK_GETRES, "clock_getres", info::sys_clock_getres),
    (NR_TIMES, "times", info::sys_times),
    (NR_GETRUSAGE, "getrusage", info::sys_getrusage),
    (NR_GETRLIMIT, "getrlimit", info::sys_getrlimit),
    (NR_SETRLIMIT, "setrlimit", info::sys_setrlimit),
    (NR_GETPRIORITY, "getpriority", info::sys_getpriority),
    (NR_SETPRIORITY, "setpriority", info::sys_setpriority),
    (NR_UMASK, "umask", info::sys_umask),
    (NR_UNAME, "uname", info::sys_uname),
    (NR_SOCKET, "socket", net::sys_socket),
    (NR_SOCKETPAIR, "socketpair", net::sys_socketpair),
    (NR_BIND, "bind", net::sys_bind),
    (NR_CONNECT, "connect", net::sys_connect),
    (NR_LISTEN, "listen", net::sys_listen),
    (NR_ACCEPT, "accept", net::sys_accept),
    (NR_GETSOCKNAME, "getsockname", net::sys_getsockname),
    (NR_GETPEERNAME, "getpeername", net::sys_getpeername),
    (NR_GETSOCKOPT, "getsockopt", net::sys_getsockopt),
    (NR_SETSOCKOPT, "setsockopt", net::sys_setsockopt),
    (NR_SENDMSG, "sendmsg", net::sys_sendmsg),
    (NR_RECVMSG, "recvmsg", net::sys_recvmsg),
    (NR_SHUTDOWN, "shutdown", net::sys_shutdown),
    (NR_REBOOT, "reboot", info::sys_reboot),
    (NR_KMLOAD, "kmload", info::sys_kmload),
    (NR_KMUNLOAD, "kmunload", info::sys_kmunload),
];

fn lookup(number: usize) -> Option<&'static (usize, &'static str, SyscallFn)> {
    SYSCALL_TABLE.iter().find(|(nr, _, _)| *nr == number)
}

/// Dispatch one call; returns the value for the ABI return register.
pub fn dispatch(
    proc_: &Arc<Process>,
    thread: &Arc<Thread>,
    number: usize,
    args: [usize; 6],
    tf: &mut Trapframe,
) -> isize {
    let Some((_, name, handler)) = lookup(number) else {
        log::debug!("syscall: unknown number {}", number);
        return KernelError::NoSyscall.to_retval();
    };
    let mut ctx = SyscallCtx {
        proc_,
        thread,
        args,
        tf,
    };
    match handler(&mut ctx) {
        Ok(val) => {
            log::trace!("{}({:#x}, ...) = {:#x}", name, args[0], val);
            val as isize
        }
        Err(err) => {
            log::trace!("{}({:#x}, ...) = {}", name, args[0], err);
            err.to_retval()
        }
    }
}

/// Number of calls in the table (diagnostics).
pub fn table_len() -> usize {
    SYSCALL_TABLE.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_unique() {
        for (i, (nr_a, name_a, _)) in SYSCALL_TABLE.iter().enumerate() {
            for (nr_b, name_b, _) in &SYSCALL_TABLE[i + 1..] {
                assert_ne!(nr_a, nr_b, "{} and {} share a number", name_a, name_b);
            }
        }
    }

    #[test]
    fn lookup_finds_known_calls() {
        assert_eq!(lookup(NR_EXIT).unwrap().1, "exit");
        assert_eq!(lookup(NR_MMAP).unwrap().1, "mmap");
        assert_eq!(lookup(NR_FUTEX).unwrap().1, "futex");
        assert!(lookup(9999).is_none());
    }

    #[test]
    fn surface_is_complete() {
        // The reference surface carries on the order of 120 calls.
        assert!(table_len() >= 100, "table has {} calls", table_len());
    }

    fn test_process() -> (Arc<Process>, Arc<Thread>) {
        let _g = crate::mm::space::test_support::lock();
        let pid = crate::process::table::alloc_id();
        let space = Arc::new(crate::mm::AddressSpace::new().unwrap());
        let proc_ = Arc::new(Process::new(pid, 1, alloc::string::String::from("t"), space));
        let thread = Arc::new(Thread::new(pid, pid, 4));
        (proc_, thread)
    }

    #[test]
    fn dispatch_runs_handlers_through_the_table() {
        let (proc_, thread) = test_process();
        let mut tf = Trapframe::default();
        let ret = dispatch(&proc_, &thread, NR_GETPID, [0; 6], &mut tf);
        assert_eq!(ret as u64, proc_.pid);
    }

    #[test]
    fn unknown_number_is_enosys() {
        let (proc_, thread) = test_process();
        let mut tf = Trapframe::default();
        let ret = dispatch(&proc_, &thread, 9999, [0; 6], &mut tf);
        assert_eq!(ret, KernelError::NoSyscall.to_retval());
    }

    #[test]
    fn umask_round_trips_through_dispatch() {
        let (proc_, thread) = test_process();
        let mut tf = Trapframe::default();
        let old = dispatch(&proc_, &thread, NR_UMASK, [0o077, 0, 0, 0, 0, 0], &mut tf);
        assert_eq!(old, 0o022);
        let prev = dispatch(&proc_, &thread, NR_UMASK, [0o022, 0, 0, 0, 0, 0], &mut tf);
        assert_eq!(prev, 0o077);
    }

    #[test]
    fn socket_reports_no_address_family() {
        let (proc_, thread) = test_process();
        let mut tf = Trapframe::default();
        let ret = dispatch(&proc_, &thread, NR_SOCKET, [2, 1, 0, 0, 0, 0], &mut tf);
        assert_eq!(ret, KernelError::AddressFamilyNotSupported.to_retval());
    }
}
