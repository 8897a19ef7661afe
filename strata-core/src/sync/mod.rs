//! Locking primitives shared by every subsystem.
//!
//! The teacher kernel exposes two primitives: a busy-waiting [`SpinLock`]
//! with explicit `unlock()` (so that lock scopes are visible at every call
//! site, not hidden in `Drop`), and an [`RwLock`] for the higher-traffic
//! read-mostly structures (the open-inode table, the supplemental page
//! table). This crate keeps that exact API shape — callers must
//! `.unlock()` a guard, and a guard dropped without unlocking panics — but
//! replaces the bare-metal busy loop with a blocking OS mutex/rwlock
//! underneath, since a hosted process has a scheduler to block on instead
//! of a CPU to spin on.
mod rwlock;
mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
