//! Structured logging facade.
//!
//! spec.md §4.12 specifies levels `TRACE/DEBUG/INFO/WARN/ERROR/FATAL`, a
//! compile-time level filter, and a no-op sink in release builds, where
//! `FATAL` aborts the process. The teacher kernel implements this with
//! bespoke `info!`/`warning!`/`debug!` macros over a serial port because it
//! has no operating system underneath it to hand logging off to. This crate
//! is hosted, so the equivalent ambient facade is the `log` crate — the same
//! role it plays in `fuser`, a hosted Rust file-system crate in the
//! retrieval pack: library code logs through `log`'s macros, and a binary
//! (here, `strata-kernel::Kernel::init`) decides where those records go.
//!
//! `trace!`, `debug!`, `info!`, `warn!`, and `error!` are plain re-exports of
//! `log`'s macros of the same name. [`fatal`] is the one addition: it logs
//! at `Level::Error` with a `FATAL` marker and then aborts, matching "FATAL
//! aborts" from spec.md §4.12.
pub use log::{Level, LevelFilter, debug, error, info, log_enabled, trace, warn};

/// Logs a kernel-fatal invariant violation and aborts the process.
///
/// Use this only for violations of invariants the core itself is supposed
/// to maintain (lock-order breaches, double frees of a sector/frame/swap
/// slot). Never call this for a condition a caller can trigger through
/// ordinary, even if invalid, input — those are [`crate::KernelError`]
/// values instead.
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    log::error!(target: "strata::fatal", "FATAL: {msg} (at {})", core::panic::Location::caller());
    std::process::abort()
}

/// Sets the process-wide level filter.
///
/// `strata-core` stays free of a hard dependency on a concrete logging sink
/// (`env_logger` is a binary-facing concern, installed once by
/// `strata-kernel::Kernel::init` or by a test harness) and only owns the
/// level filter, which every subsystem's `log` call checks before
/// formatting its message.
pub fn set_max_level(filter: LevelFilter) {
    log::set_max_level(filter);
}
