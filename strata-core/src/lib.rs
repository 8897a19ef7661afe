//! # strata-core
//!
//! Shared foundation for the `strata` kernel-core workspace: the error type
//! every subsystem returns, the logging facade, the two locking primitives
//! used throughout (`SpinLock`, `RwLock`), and the facade traits that let
//! `strata-fs` and `strata-vm` be built and tested without a real block
//! device, MMU, or scheduler underneath them.
//!
//! Nothing in this crate knows about sectors, inodes, frames, or pages. It is
//! the layer every other crate in the workspace depends on, never the other
//! way around.

pub mod error;
pub mod facade;
pub mod logging;
pub mod sync;

#[cfg(feature = "testing")]
pub mod testing;

pub use error::KernelError;
