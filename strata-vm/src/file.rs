//! Thin facades the VM core uses to read/write file-backed pages and
//! directory entries without depending on `strata-fs` directly, mirroring
//! the `BlockDevice`/`Mmu`/`Scheduler` facade pattern in
//! `strata-core::facade`. `strata-kernel` wires `strata_fs::Inode` and
//! `strata_fs::Directory` into these traits.
use strata_core::error::Result;

/// A file that pages can be mapped from or written back to (mmap, EXEC
/// segments).
pub trait PageBackedFile: Send + Sync {
    fn length(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;
}

/// A directory handle a file descriptor can point at.
pub trait DirHandle: Send + Sync {
    fn readdir(&mut self) -> Result<Option<String>>;
}
