//! Bridges `strata-fs`'s inode/directory handles into the facade traits
//! `strata-vm` drives page faults and `readdir` syscalls through, so
//! `strata-vm` never depends on `strata-fs` directly.
//!
//! Both adapters hold the inode's open reference for their own lifetime
//! and release it (via [`strata_fs::InodeTable::close`]) when dropped,
//! since the fd table in `strata-vm::ProcessVm` only ever drops its
//! `Arc<dyn PageBackedFile>`/`Box<dyn DirHandle>`, never calls back into
//! `strata-fs` directly.
use std::sync::Arc;

use strata_core::error::Result;
use strata_core::logging;
use strata_fs::{Directory, Inode, InodeTable};
use strata_vm::{DirHandle, PageBackedFile};

/// Adapts an open [`Inode`] to [`PageBackedFile`] for EXEC-segment and
/// mmap page faults.
pub struct InodeFile {
    inode: Arc<Inode>,
    table: Arc<InodeTable>,
}

impl InodeFile {
    pub fn new(inode: Arc<Inode>, table: Arc<InodeTable>) -> InodeFile {
        InodeFile { inode, table }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }
}

impl PageBackedFile for InodeFile {
    fn length(&self) -> u64 {
        self.inode.length()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inode.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.inode.write_at(offset, data)
    }
}

impl Drop for InodeFile {
    fn drop(&mut self) {
        if let Err(e) = self.table.close(self.inode.sector()) {
            logging::fatal(&format!("closing fd's inode reference failed: {e}"));
        }
    }
}

/// Adapts a [`Directory`] cursor to [`DirHandle`] for the `readdir`
/// syscall. A file descriptor owns its `Directory` exclusively, so no
/// internal lock is needed beyond the `&mut self` the trait already gives.
pub struct FsDirHandle {
    dir: Directory,
    table: Arc<InodeTable>,
}

impl FsDirHandle {
    pub fn new(dir: Directory, table: Arc<InodeTable>) -> FsDirHandle {
        FsDirHandle { dir, table }
    }
}

impl DirHandle for FsDirHandle {
    fn readdir(&mut self) -> Result<Option<String>> {
        self.dir.readdir()
    }
}

impl Drop for FsDirHandle {
    fn drop(&mut self) {
        let sector = self.dir.inode().sector();
        if let Err(e) = self.table.close(sector) {
            logging::fatal(&format!("closing fd's directory reference failed: {e}"));
        }
    }
}
