//! Virtual-memory layout constants.
//!
//! `PHYS_BASE`/`STACK_LIMIT` follow the Pintos-style split spec.md §8
//! scenario 4 implies (`esp = 0xbffffe00`, growth allowed down to
//! `esp - 32`): the user stack sits just below a fixed kernel/user split
//! with an 8 MiB growth ceiling.
pub const PGSIZE: usize = 4096;

/// Sectors per page on the swap device (`PGSIZE / SECTOR_SIZE`).
pub const SECTORS_PER_PAGE: usize = PGSIZE / strata_core::facade::SECTOR_SIZE;

/// Top of the user address space.
pub const PHYS_BASE: usize = 0xc000_0000;

/// Lowest address a stack-growth fault may allocate (spec.md §4.10):
/// an 8 MiB maximum stack.
pub const STACK_LIMIT: usize = PHYS_BASE - 8 * 1024 * 1024;

/// How far below `esp` a fault may still count as stack growth
/// (spec.md §4.10: `addr >= esp - 32`, covering `PUSHA`'s reach).
pub const STACK_GROWTH_SLACK: usize = 32;
