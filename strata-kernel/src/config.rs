//! Every magic number spec.md fixes as a constant, collected into one
//! struct so tests can shrink the cache or frame pool without touching
//! subsystem code (spec.md §6).
use std::time::Duration;

/// Kernel-wide tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Entries in the sector cache (spec.md §4.3: `CACHE_ENTRIES`).
    pub cache_entries: usize,
    /// How often the write-behind daemon sweeps dirty entries.
    pub flush_interval: Duration,
    /// Physical frames in the user pool (spec.md §4.9).
    pub frame_pool_size: usize,
    /// Maximum path-component length (spec.md §4.5: `NAME_MAX`).
    pub name_max: usize,
    /// Lowest address a stack-growth fault may allocate (spec.md §4.10).
    pub stack_limit: usize,
    /// Recorded for an external scheduler's benefit; inert here since the
    /// scheduler itself is out of scope (spec.md §1).
    pub mlfqs: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            cache_entries: strata_fs::constants::CACHE_ENTRIES,
            flush_interval: Duration::from_secs(30),
            frame_pool_size: 256,
            name_max: strata_fs::constants::NAME_MAX,
            stack_limit: strata_vm::constants::STACK_LIMIT,
            mlfqs: false,
        }
    }
}
