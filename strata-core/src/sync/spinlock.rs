//! A mutual-exclusion primitive with an explicit unlock.
use std::sync::{Mutex, MutexGuard};

/// The lock could not be acquired without blocking.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Unlike [`std::sync::Mutex`], the guard returned by [`lock`] must be
/// released with an explicit call to [`SpinLockGuard::unlock`]. A guard
/// dropped while still holding the lock panics — the same discipline the
/// teacher kernel's `abyss::spinlock::SpinLock` imposes, so that every
/// critical section in `strata-fs`/`strata-vm` has a visible start and end
/// rather than an implicit scope-exit release, which matters when
/// following the lock-order rules in spec.md §4.12/§5.
///
/// [`lock`]: Self::lock
pub struct SpinLock<T: ?Sized> {
    inner: Mutex<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            inner: Mutex::new(t),
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, blocking the current thread until it is able to
    /// do so.
    ///
    /// Poisoning (a previous holder panicking mid-critical-section) is
    /// treated as a fatal kernel invariant violation, since the core never
    /// expects a panic while holding a lock documented in spec.md §4.12's
    /// lock order.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|_| crate::logging::fatal("spinlock holder panicked"));
        SpinLockGuard {
            caller: std::panic::Location::caller(),
            guard: Some(guard),
        }
    }

    /// Attempts to acquire this lock without blocking.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(SpinLockGuard {
                caller: std::panic::Location::caller(),
                guard: Some(guard),
            }),
            Err(std::sync::TryLockError::WouldBlock) => Err(WouldBlock),
            Err(std::sync::TryLockError::Poisoned(_)) => {
                crate::logging::fatal("spinlock holder panicked")
            }
        }
    }
}

/// An RAII guard returned by [`SpinLock::lock`]/[`SpinLock::try_lock`].
///
/// Must be released with [`unlock`](Self::unlock); dropping it while still
/// held panics.
pub struct SpinLockGuard<'a, T: ?Sized> {
    caller: &'static std::panic::Location<'static>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// Releases the lock.
    pub fn unlock(mut self) {
        self.guard.take();
    }
}

impl<T: ?Sized> std::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("use after unlock")
    }
}

impl<T: ?Sized> std::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("use after unlock")
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if self.guard.is_some() && !std::thread::panicking() {
            panic!("SpinLockGuard acquired at {} dropped without unlock()", self.caller);
        }
    }
}
