//! Synchronization primitives
//!
//! Safe global-state management for the kernel's process-wide singletons
//! (CPU array, process table, IRQ router, ACPI state). Spin locks come from
//! the `spin` crate; this module only adds the once-init wrappers.

pub mod once_lock;

pub use once_lock::{GlobalState, OnceLock};
