//! The assembled kernel: wires `strata-fs` and `strata-vm` together behind
//! one entry point, and owns process lifecycle (spec.md §4.12, C12).
//!
//! Lock order across the two subsystems (spec.md §4.12/§5): a caller that
//! needs both a process's page tables and the file system must acquire
//! `fs-module open-table lock -> fs-device I/O lock -> cache directory lock
//! -> cache entry lock` before `frame-table lock -> SPTE lock -> swap lock
//! -> fs-device I/O lock`. In practice this only matters inside
//! [`Kernel::page_fault`]'s `EXEC`/`FILESYS` branches, which read through
//! an already-open [`strata_fs::Inode`] (no directory or free-map lock is
//! ever taken on the fault path).
use std::sync::Arc;

use strata_core::error::Result;
use strata_core::facade::{BlockDevice, Mmu, ThreadId, VirtAddr};
use strata_vm::{FaultOutcome, FrameTable, ProcessVm, SwapStore};

use crate::adapters::{FsDirHandle, InodeFile};
use crate::config::Config;

/// The running kernel: one file system, one frame pool, one swap store,
/// shared by every process.
pub struct Kernel {
    fs: strata_fs::FileSystem,
    frame_table: FrameTable,
    swap: SwapStore,
    mmu: Arc<dyn Mmu>,
    config: Config,
}

impl Kernel {
    /// Installs the logging sink and level filter. Call once, before
    /// anything else; idempotent beyond the first call's effect.
    pub fn init_logging() {
        #[cfg(feature = "env-logger")]
        {
            let _ = env_logger::try_init();
        }
        strata_core::logging::set_max_level(strata_core::logging::LevelFilter::Info);
    }

    /// Formats a fresh file system on `fs_device` and boots the kernel on
    /// top of it.
    pub fn format(fs_device: Arc<dyn BlockDevice>, swap_device: Arc<dyn BlockDevice>, mmu: Arc<dyn Mmu>, config: Config) -> Result<Kernel> {
        let fs = strata_fs::FileSystem::format_with(fs_device, config.cache_entries, config.name_max, config.flush_interval)?;
        strata_core::logging::info!("formatted a fresh file system, {} frame(s) in the user pool", config.frame_pool_size);
        Ok(Kernel::assemble(fs, swap_device, mmu, config))
    }

    /// Boots the kernel on an already-formatted file system.
    pub fn open(fs_device: Arc<dyn BlockDevice>, swap_device: Arc<dyn BlockDevice>, mmu: Arc<dyn Mmu>, config: Config) -> Result<Kernel> {
        let fs = strata_fs::FileSystem::open_with(fs_device, config.cache_entries, config.name_max, config.flush_interval)?;
        strata_core::logging::info!("mounted file system, {} frame(s) in the user pool", config.frame_pool_size);
        Ok(Kernel::assemble(fs, swap_device, mmu, config))
    }

    fn assemble(fs: strata_fs::FileSystem, swap_device: Arc<dyn BlockDevice>, mmu: Arc<dyn Mmu>, config: Config) -> Kernel {
        let frame_table = FrameTable::new(Arc::clone(&mmu), config.frame_pool_size);
        let swap = SwapStore::new(swap_device);
        Kernel {
            fs,
            frame_table,
            swap,
            mmu,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fs(&self) -> &strata_fs::FileSystem {
        &self.fs
    }

    pub fn frame_table(&self) -> &FrameTable {
        &self.frame_table
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// Creates a fresh process address space rooted at the file system's
    /// root directory.
    pub fn spawn_process(&self) -> ProcessVm {
        let pagedir = self.mmu.create_pagedir();
        ProcessVm::new(pagedir, self.fs.root_sector())
    }

    /// Tears down a process: writes back and releases every mmap region
    /// (the caller must have already called [`ProcessVm::munmap`] for
    /// each), frees the rest of its frames/swap slots, and destroys its
    /// page directory.
    pub fn destroy_process(&self, vm: &ProcessVm) {
        vm.spt.destroy(&self.frame_table, &self.swap);
        self.mmu.destroy_pagedir(vm.pagedir);
    }

    /// Changes `vm`'s working directory to `path`. `vm` only ever tracks
    /// its cwd by sector number, not as a held-open inode reference, so
    /// the resolved handle is closed immediately after recording its
    /// sector (spec.md §4.6 resolves by sector on every call anyway).
    pub fn chdir(&self, vm: &ProcessVm, path: &str) -> Result<()> {
        let inode = self.fs.chdir(vm.cwd(), path)?;
        let sector = inode.sector();
        self.fs.close(inode)?;
        vm.set_cwd(sector);
        Ok(())
    }

    /// Opens `path` (relative to `vm`'s cwd) and installs it as an open
    /// file descriptor.
    pub fn open_file(&self, vm: &ProcessVm, path: &str) -> Result<i32> {
        let inode = self.fs.open(vm.cwd(), path)?;
        Ok(vm.open_file(Arc::new(InodeFile::new(inode, Arc::clone(self.fs.table())))))
    }

    /// Opens `path` as a directory descriptor.
    pub fn open_dir(&self, vm: &ProcessVm, path: &str) -> Result<i32> {
        let dir = self.fs.opendir(vm.cwd(), path)?;
        Ok(vm.open_dir(Box::new(FsDirHandle::new(dir, Arc::clone(self.fs.table())))))
    }

    /// Maps the file open at `path` into `vm`'s address space at `addr`.
    pub fn mmap(&self, vm: &ProcessVm, path: &str, addr: VirtAddr) -> Result<i32> {
        let inode = self.fs.open(vm.cwd(), path)?;
        vm.mmap(addr, Arc::new(InodeFile::new(inode, Arc::clone(self.fs.table()))))
    }

    pub fn munmap(&self, vm: &ProcessVm, mapid: i32) -> Result<()> {
        vm.munmap(mapid, &self.frame_table)
    }

    /// Resolves a page fault for `vm` (spec.md §4.10).
    pub fn page_fault(&self, vm: &ProcessVm, owner: ThreadId, esp: usize, fault_addr: VirtAddr, is_write: bool) -> Result<FaultOutcome> {
        vm.spt.pull(esp, fault_addr, is_write, &self.frame_table, &self.swap, vm.pagedir, owner, self.config.stack_limit)
    }

    /// Flushes the cache and persists the free map (spec.md §4.12's
    /// shutdown sequence: the cache's daemons are stopped by dropping it).
    pub fn shutdown(self) -> Result<()> {
        self.fs.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::facade::DeviceRole;
    use strata_core::testing::{MemBlockDevice, MockMmu};

    fn boot(fs_sectors: u32, swap_sectors: u32, config: Config) -> Kernel {
        let fs_dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(fs_sectors, DeviceRole::Filesys));
        let swap_dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(swap_sectors, DeviceRole::Swap));
        let mmu: Arc<dyn Mmu> = Arc::new(MockMmu::new());
        Kernel::format(fs_dev, swap_dev, mmu, config).unwrap()
    }

    #[test]
    fn remove_while_fd_open_then_fd_close_finishes_deletion() {
        let kernel = boot(1 << 15, 64, Config::default());
        let vm = kernel.spawn_process();
        kernel.fs().create(vm.cwd(), "/a", 0).unwrap();

        let fd = kernel.open_file(&vm, "/a").unwrap();
        kernel.fs().remove(vm.cwd(), "/a").unwrap();
        assert!(!kernel.fs().exists(vm.cwd(), "/a").unwrap());

        vm.close_fd(fd);
        // Dropping the fd released the adapter's inode reference, which
        // should have been the last one and triggered on-disk deletion;
        // a fresh file may now reuse the name.
        kernel.fs().create(vm.cwd(), "/a", 0).unwrap();
    }

    #[test]
    fn chdir_then_relative_create() {
        let kernel = boot(1 << 15, 64, Config::default());
        let vm = kernel.spawn_process();
        kernel.fs().mkdir(vm.cwd(), "/sub").unwrap();
        kernel.chdir(&vm, "/sub").unwrap();
        kernel.fs().create(vm.cwd(), "leaf", 0).unwrap();
        assert!(kernel.fs().exists(vm.cwd(), "leaf").unwrap());
    }

    #[test]
    fn page_fault_for_unmapped_address_without_stack_growth_kills() {
        let kernel = boot(1 << 15, 64, Config::default());
        let vm = kernel.spawn_process();
        let outcome = kernel.page_fault(&vm, ThreadId(0), 0, VirtAddr(0x1000), false).unwrap();
        assert_eq!(outcome, FaultOutcome::Kill);
    }
}
