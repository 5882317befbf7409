//! Architecture abstraction
//!
//! The generic core calls only the surface each backend re-exports here:
//! page-table root management (`vm`), TLB invalidation, trapframe
//! accessors, FPU state, interrupt masking, IPI delivery, and the
//! controller hooks used by the IRQ router.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

#[cfg(target_arch = "riscv64")]
pub use riscv64::*;
