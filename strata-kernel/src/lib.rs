//! Wires `strata-fs` and `strata-vm` together behind one [`Kernel`], owns
//! its configuration, and bridges the two crates' facade traits (C12).
pub mod adapters;
pub mod config;
pub mod kernel;

pub use adapters::{FsDirHandle, InodeFile};
pub use config::Config;
pub use kernel::Kernel;
