//! Locking discipline for the two-phase allocator bootstrap.
//!
//! The earliest initialization phase runs while only the boot core is alive
//! and before a page table covering all memory exists on every core, so the
//! allocator must not take its lock there. Once the second phase completes,
//! every access is serialized. [`PhaseLock`] captures that protocol: a mutex
//! that is bypassed until [`enable`](PhaseLock::enable) is called, after
//! which it behaves like an ordinary spinlock forever.

use core::sync::atomic::{AtomicBool, Ordering};

use spin::mutex::SpinMutex as Mutex;

/// A mutex whose acquisition is skipped until locking is enabled.
///
/// The enable flag flips exactly once, from disabled to enabled; there is no
/// way back. While disabled, [`with`](PhaseLock::with) hands out the guarded
/// value unsynchronized, which is sound only while a single execution
/// context exists.
pub struct PhaseLock<T> {
    enabled: AtomicBool,
    inner: Mutex<T>,
}

impl<T> PhaseLock<T> {
    /// Creates a new phase lock around `value`, with locking disabled.
    pub const fn new(value: T) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            inner: Mutex::new(value),
        }
    }

    /// Turns locking on. One-way; later calls have no further effect.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Returns whether locking is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Runs `f` on the guarded value, holding the lock if locking is enabled.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if self.is_enabled() {
            let mut guard = self.inner.lock();
            f(&mut guard)
        } else {
            // SAFETY: callers keep the flag unset only while exactly one
            // execution context is live (the boot core, before secondary
            // cores have a usable page table), so no concurrent access to
            // the guarded value can exist.
            unsafe { f(&mut *self.inner.as_mut_ptr()) }
        }
    }
}
