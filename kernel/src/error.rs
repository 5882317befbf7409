//! Kernel error types for VermilionOS
//!
//! Every fallible kernel operation returns a typed [`KernelError`]. At the
//! system-call boundary each error kind maps one-to-one onto a POSIX errno
//! value, returned to user space as a negative value in `[-4095, -1]`.

use core::fmt;

/// Main kernel error type.
///
/// The variant set mirrors the POSIX errno values the system-call surface
/// can produce. A few variants carry context that is useful in kernel logs
/// but is erased at the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Invalid argument (EINVAL)
    Invalid,
    /// Out of memory (ENOMEM)
    OutOfMemory,
    /// No such file, object, or ACPI node (ENOENT)
    NoEntry,
    /// Operation not permitted (EPERM)
    NotPermitted,
    /// Permission denied (EACCES)
    AccessDenied,
    /// Bad user-space address (EFAULT)
    BadAddress { addr: usize },
    /// Object already exists (EEXIST)
    AlreadyExists,
    /// Resource busy (EBUSY)
    Busy,
    /// Try again / would block (EAGAIN)
    WouldBlock,
    /// Interrupted by a signal (EINTR)
    Interrupted,
    /// System call not implemented (ENOSYS)
    NoSyscall,
    /// Cross-device link (EXDEV)
    CrossDevice,
    /// Is a directory (EISDIR)
    IsDirectory,
    /// Not a directory (ENOTDIR)
    NotDirectory,
    /// I/O error (EIO)
    Io,
    /// Operation not supported (EOPNOTSUPP)
    NotSupported,
    /// Address family not supported (EAFNOSUPPORT)
    AddressFamilyNotSupported,
    /// Socket not connected (ENOTCONN)
    NotConnected,
    /// Socket already connected (EISCONN)
    IsConnected,
    /// Broken pipe (EPIPE)
    BrokenPipe,
    /// Read-only file system (EROFS)
    ReadOnlyFs,
    /// No child processes (ECHILD)
    NoChild,
    /// No such process (ESRCH)
    NoProcess,
    /// Bad file descriptor (EBADF)
    BadFd,
    /// Result out of range (ERANGE)
    OutOfRange,
    /// Illegal byte sequence (EILSEQ)
    IllegalSequence,
    /// Operation timed out (ETIMEDOUT)
    TimedOut,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// POSIX errno value for this error kind.
    pub const fn errno(self) -> i32 {
        match self {
            Self::NotPermitted => 1,               // EPERM
            Self::NoEntry => 2,                    // ENOENT
            Self::NoProcess => 3,                  // ESRCH
            Self::Interrupted => 4,                // EINTR
            Self::Io => 5,                         // EIO
            Self::BadFd => 9,                      // EBADF
            Self::NoChild => 10,                   // ECHILD
            Self::WouldBlock => 11,                // EAGAIN
            Self::OutOfMemory => 12,               // ENOMEM
            Self::AccessDenied => 13,              // EACCES
            Self::BadAddress { .. } => 14,         // EFAULT
            Self::Busy => 16,                      // EBUSY
            Self::AlreadyExists => 17,             // EEXIST
            Self::CrossDevice => 18,               // EXDEV
            Self::NotDirectory => 20,              // ENOTDIR
            Self::IsDirectory => 21,               // EISDIR
            Self::Invalid => 22,                   // EINVAL
            Self::ReadOnlyFs => 30,                // EROFS
            Self::BrokenPipe => 32,                // EPIPE
            Self::OutOfRange => 34,                // ERANGE
            Self::NoSyscall => 38,                 // ENOSYS
            Self::IllegalSequence => 84,           // EILSEQ
            Self::NotSupported => 95,              // EOPNOTSUPP
            Self::AddressFamilyNotSupported => 97, // EAFNOSUPPORT
            Self::IsConnected => 106,              // EISCONN
            Self::NotConnected => 107,             // ENOTCONN
            Self::TimedOut => 110,                 // ETIMEDOUT
        }
    }

    /// Encode for the syscall return register: `-errno`, always within
    /// `[-4095, -1]`.
    pub const fn to_retval(self) -> isize {
        -(self.errno() as isize)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NoEntry => write!(f, "no such entry"),
            Self::NotPermitted => write!(f, "operation not permitted"),
            Self::AccessDenied => write!(f, "permission denied"),
            Self::BadAddress { addr } => write!(f, "bad address 0x{:x}", addr),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Busy => write!(f, "resource busy"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Interrupted => write!(f, "interrupted by signal"),
            Self::NoSyscall => write!(f, "syscall not implemented"),
            Self::CrossDevice => write!(f, "cross-device link"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::Io => write!(f, "I/O error"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::AddressFamilyNotSupported => write!(f, "address family not supported"),
            Self::NotConnected => write!(f, "not connected"),
            Self::IsConnected => write!(f, "already connected"),
            Self::BrokenPipe => write!(f, "broken pipe"),
            Self::ReadOnlyFs => write!(f, "read-only file system"),
            Self::NoChild => write!(f, "no child processes"),
            Self::NoProcess => write!(f, "no such process"),
            Self::BadFd => write!(f, "bad file descriptor"),
            Self::OutOfRange => write!(f, "result out of range"),
            Self::IllegalSequence => write!(f, "illegal byte sequence"),
            Self::TimedOut => write!(f, "operation timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_posix() {
        assert_eq!(KernelError::NotPermitted.errno(), 1);
        assert_eq!(KernelError::NoEntry.errno(), 2);
        assert_eq!(KernelError::Interrupted.errno(), 4);
        assert_eq!(KernelError::WouldBlock.errno(), 11);
        assert_eq!(KernelError::BadAddress { addr: 0 }.errno(), 14);
        assert_eq!(KernelError::Invalid.errno(), 22);
        assert_eq!(KernelError::NoSyscall.errno(), 38);
    }

    #[test]
    fn retval_is_within_errno_window() {
        for err in [
            KernelError::Invalid,
            KernelError::OutOfMemory,
            KernelError::TimedOut,
            KernelError::AddressFamilyNotSupported,
        ] {
            let rv = err.to_retval();
            assert!((-4095..=-1).contains(&rv), "{:?} -> {}", err, rv);
        }
    }

    #[test]
    fn display_is_human_readable() {
        extern crate std;
        use std::string::ToString;
        assert_eq!(KernelError::BrokenPipe.to_string(), "broken pipe");
        assert_eq!(
            KernelError::BadAddress { addr: 0x1000 }.to_string(),
            "bad address 0x1000"
        );
    }
}
