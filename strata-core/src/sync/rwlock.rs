//! A reader-writer lock with explicit unlock, for read-mostly shared state
//! such as the open-inode table and the supplemental page table.
use std::sync::{RwLock as StdRwLock, RwLockReadGuard as StdReadGuard, RwLockWriteGuard as StdWriteGuard};

/// A reader-writer lock.
///
/// Any number of readers may hold the lock concurrently, or at most one
/// writer. As with [`crate::sync::SpinLock`], guards must be released with
/// an explicit `unlock()` call; dropping one while still held panics.
pub struct RwLock<T: ?Sized> {
    inner: StdRwLock<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new reader-writer lock in an unlocked state.
    pub const fn new(t: T) -> RwLock<T> {
        RwLock {
            inner: StdRwLock::new(t),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Locks this lock with shared read access, blocking until available.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|_| crate::logging::fatal("rwlock holder panicked"));
        RwLockReadGuard { guard: Some(guard) }
    }

    /// Locks this lock with exclusive write access, blocking until
    /// available.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let guard = self
            .inner
            .write()
            .unwrap_or_else(|_| crate::logging::fatal("rwlock holder panicked"));
        RwLockWriteGuard { guard: Some(guard) }
    }
}

/// An RAII guard returned by [`RwLock::read`].
pub struct RwLockReadGuard<'a, T: ?Sized> {
    guard: Option<StdReadGuard<'a, T>>,
}

impl<'a, T: ?Sized> RwLockReadGuard<'a, T> {
    /// Releases the read lock.
    pub fn unlock(mut self) {
        self.guard.take();
    }
}

impl<T: ?Sized> std::ops::Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("use after unlock")
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        if self.guard.is_some() && !std::thread::panicking() {
            panic!("RwLockReadGuard dropped without unlock()");
        }
    }
}

/// An RAII guard returned by [`RwLock::write`].
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    guard: Option<StdWriteGuard<'a, T>>,
}

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    /// Releases the write lock.
    pub fn unlock(mut self) {
        self.guard.take();
    }
}

impl<T: ?Sized> std::ops::Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().expect("use after unlock")
    }
}

impl<T: ?Sized> std::ops::DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("use after unlock")
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        if self.guard.is_some() && !std::thread::panicking() {
            panic!("RwLockWriteGuard dropped without unlock()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_readers() {
        let l = RwLock::new(5);
        let a = l.read();
        let b = l.read();
        assert_eq!(*a, 5);
        assert_eq!(*b, 5);
        a.unlock();
        b.unlock();
    }

    #[test]
    fn writer_excludes() {
        let l = RwLock::new(0);
        let mut w = l.write();
        *w = 42;
        w.unlock();
        assert_eq!(*l.read(), 42);
    }
}
