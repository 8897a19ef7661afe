//! On-disk format constants (spec.md §6, bit-exact).
use strata_core::facade::SectorId;

/// Bytes per sector; re-exported from `strata-core` for callers that only
/// depend on `strata-fs`.
pub const SECTOR_SIZE: usize = strata_core::facade::SECTOR_SIZE;

/// Direct block pointers in an inode's index.
pub const N_DIRECT: usize = 10;
/// Indirect block pointers (each addressing a full sector of pointers).
pub const N_INDIRECT: usize = 1;
/// Double-indirect block pointers.
pub const N_DOUBLE: usize = 1;
/// `blocks[12]`: 10 direct + 1 indirect + 1 double-indirect.
pub const N_BLOCKS: usize = N_DIRECT + N_INDIRECT + N_DOUBLE;

/// Pointers per index sector (`512 / size_of::<u32>()`).
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Maximum bytes addressable by one inode's index tree.
pub const MAX_FILE_SIZE: u64 =
    ((N_DIRECT + PTRS_PER_SECTOR + PTRS_PER_SECTOR * PTRS_PER_SECTOR) * SECTOR_SIZE) as u64;

/// Maximum path-component length, excluding the NUL terminator.
pub const NAME_MAX: usize = 14;

/// Inode magic number stamped into every on-disk inode (spec.md §6).
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Fixed sector holding the free-map inode.
pub const FREE_MAP_SECTOR: SectorId = SectorId(0);
/// Fixed sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: SectorId = SectorId(2);

/// Entries in the sector cache's fixed array (spec.md §4.3).
pub const CACHE_ENTRIES: usize = 64;
