//! Safe one-shot global initialization
//!
//! The kernel has several process-wide singletons that must be initialized
//! exactly once, in a deterministic order, during bring-up (boot info, the
//! IRQ router, the ACPI interpreter). These wrappers replace `static mut`
//! with atomics and a mutex-guarded option.

#[cfg(feature = "alloc")]
extern crate alloc;

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

/// A cell that can be written only once.
///
/// Similar to `std::sync::OnceLock` but usable in `no_std`. The value is
/// heap-allocated on `set` and leaked for the `'static` lifetime; the cell
/// is only dropped at kernel teardown, which never happens.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    /// Create a new empty cell.
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set` via
            // `Box::into_raw`, so it refers to a valid heap allocation. The
            // Acquire load synchronizes with the Release in `set`, so the
            // pointee is fully initialized. The allocation is never freed
            // while the kernel runs, justifying the 'static lifetime.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns `Err(value)` if already initialized.
    #[cfg(feature = "alloc")]
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `ptr` came from `Box::into_raw` above and lost the
                // race, so we still own the allocation and must reclaim it.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }

    /// Get the value, initializing it with `f` if empty.
    #[cfg(feature = "alloc")]
    pub fn get_or_init<F: FnOnce() -> T>(&self, f: F) -> &'static T {
        if let Some(val) = self.get() {
            return val;
        }
        let _ = self.set(f());
        self.get().expect("OnceLock empty after set")
    }
}

// SAFETY: the value is behind an AtomicPtr with Acquire/Release ordering;
// ownership transfer requires T: Send.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: shared access hands out &T, so T must be Sync; the CAS in `set`
// guarantees at most one initialization.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: exclusive access in drop; the pointer came from
            // `Box::into_raw` in `set`.
            #[cfg(feature = "alloc")]
            unsafe {
                let _ = alloc::boxed::Box::from_raw(ptr);
            }
        }
    }
}

/// Mutex-guarded global state.
///
/// Unlike [`OnceLock`] the value is stored inline and accessed through
/// closures, which keeps lock scopes explicit at the call site.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GlobalState<T> {
    /// Create new uninitialized global state.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the state. Returns `Err(value)` if already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(value);
        }
        *guard = Some(value);
        Ok(())
    }

    /// Run `f` with shared access to the state, if initialized.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.lock().as_ref().map(f)
    }

    /// Run `f` with exclusive access to the state, if initialized.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }

    /// Whether the state has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_lock_set_then_get() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.get(), Some(&7));
        assert_eq!(cell.set(9), Err(9));
        assert_eq!(cell.get(), Some(&7));
    }

    #[test]
    fn once_lock_get_or_init_runs_once() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert_eq!(*cell.get_or_init(|| 1), 1);
        assert_eq!(*cell.get_or_init(|| 2), 1);
    }

    #[test]
    fn global_state_init_and_access() {
        let state: GlobalState<u64> = GlobalState::new();
        assert!(!state.is_initialized());
        assert!(state.with(|_| ()).is_none());
        assert!(state.init(41).is_ok());
        assert_eq!(state.init(99), Err(99));
        assert_eq!(state.with_mut(|v| {
            *v += 1;
            *v
        }), Some(42));
    }
}
