//! File-system API: create/open/remove/mkdir/chdir/readdir/exists/isdir
//! (spec.md §4.7, C7). The top of the `strata-fs` stack; everything else
//! in this crate is reachable only through here (or through the types it
//! hands back, e.g. [`Arc<Inode>`] and [`Directory`]).
use std::sync::Arc;
use std::time::Duration;

use strata_core::error::{KernelError, Result};
use strata_core::facade::{BlockDevice, SectorId};

use crate::cache::SectorCache;
use crate::constants::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::directory::Directory;
use crate::freemap::FreeMap;
use crate::inode::{Inode, InodeTable};
use crate::layout::InodeKind;
use crate::path::{PathResolver, Resolved};

/// The assembled file system: free map, sector cache, inode table, and
/// path resolver wired together over one [`BlockDevice`].
pub struct FileSystem {
    cache: Arc<SectorCache>,
    free_map: Arc<FreeMap>,
    table: Arc<InodeTable>,
    resolver: PathResolver,
}

impl FileSystem {
    /// Formats a fresh file system on `device`: a free map reserving the
    /// free-map and root-directory sectors, and an empty root directory
    /// whose `.` and `..` both point at itself (spec.md §3, §6).
    pub fn format(device: Arc<dyn BlockDevice>, flush_interval: Duration) -> Result<FileSystem> {
        Self::format_with(device, crate::constants::CACHE_ENTRIES, crate::constants::NAME_MAX, flush_interval)
    }

    /// Like [`FileSystem::format`] but with explicit cache capacity and
    /// `NAME_MAX`, for callers threading those through from a kernel-wide
    /// config struct (spec.md §6).
    pub fn format_with(device: Arc<dyn BlockDevice>, cache_capacity: usize, name_max: usize, flush_interval: Duration) -> Result<FileSystem> {
        let num_sectors = device.num_sectors();
        let cache = SectorCache::with_capacity(device, cache_capacity, flush_interval);
        let bitmap_base = SectorId(ROOT_DIR_SECTOR.0 + 1);
        let free_map = Arc::new(FreeMap::format(
            Arc::clone(&cache),
            bitmap_base,
            num_sectors,
            &[FREE_MAP_SECTOR, ROOT_DIR_SECTOR],
        )?);
        let table = Arc::new(InodeTable::new(Arc::clone(&cache), Arc::clone(&free_map)));
        table.create(ROOT_DIR_SECTOR, InodeKind::Dir)?;
        let root = table.open(ROOT_DIR_SECTOR)?;
        Directory::init_self_and_parent(&root, ROOT_DIR_SECTOR)?;
        table.close(ROOT_DIR_SECTOR)?;
        free_map.sync()?;

        Ok(FileSystem {
            cache,
            resolver: PathResolver::new(Arc::clone(&table), ROOT_DIR_SECTOR, name_max),
            free_map,
            table,
        })
    }

    /// Opens an existing file system previously formatted on `device`.
    pub fn open(device: Arc<dyn BlockDevice>, flush_interval: Duration) -> Result<FileSystem> {
        Self::open_with(device, crate::constants::CACHE_ENTRIES, crate::constants::NAME_MAX, flush_interval)
    }

    /// Like [`FileSystem::open`] but with explicit cache capacity and
    /// `NAME_MAX`; see [`FileSystem::format_with`].
    pub fn open_with(device: Arc<dyn BlockDevice>, cache_capacity: usize, name_max: usize, flush_interval: Duration) -> Result<FileSystem> {
        let num_sectors = device.num_sectors();
        let cache = SectorCache::with_capacity(device, cache_capacity, flush_interval);
        let bitmap_base = SectorId(ROOT_DIR_SECTOR.0 + 1);
        let free_map = Arc::new(FreeMap::open(Arc::clone(&cache), bitmap_base, num_sectors)?);
        let table = Arc::new(InodeTable::new(Arc::clone(&cache), Arc::clone(&free_map)));
        Ok(FileSystem {
            cache,
            resolver: PathResolver::new(Arc::clone(&table), ROOT_DIR_SECTOR, name_max),
            free_map,
            table,
        })
    }

    pub fn root_sector(&self) -> SectorId {
        self.resolver.root_sector()
    }

    /// Creates a new, empty (then grown to `initial_size`) regular file at
    /// `path`. Fails if the parent does not exist, the final component
    /// already exists, or the name is empty/oversized.
    pub fn create(&self, cwd: SectorId, path: &str, initial_size: u64) -> Result<()> {
        match self.resolver.resolve(path, cwd)? {
            Resolved::Found(existing) => {
                self.table.close(existing.sector())?;
                Err(KernelError::Exists)
            }
            Resolved::MissingLast { parent, name } => {
                let result = self.create_in(&parent, &name, InodeKind::File, initial_size, None);
                self.table.close(parent.sector())?;
                result
            }
        }
    }

    /// Creates directory `path`, initializing `.`/`..`.
    pub fn mkdir(&self, cwd: SectorId, path: &str) -> Result<()> {
        match self.resolver.resolve(path, cwd)? {
            Resolved::Found(existing) => {
                self.table.close(existing.sector())?;
                Err(KernelError::Exists)
            }
            Resolved::MissingLast { parent, name } => {
                let parent_sector = parent.sector();
                let result = self.create_in(&parent, &name, InodeKind::Dir, 0, Some(parent_sector));
                self.table.close(parent_sector)?;
                result
            }
        }
    }

    fn create_in(&self, parent: &Arc<Inode>, name: &str, kind: InodeKind, initial_size: u64, dotdot: Option<SectorId>) -> Result<()> {
        if !parent.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        let sector = self.free_map.allocate()?;
        self.table.create(sector, kind)?;

        let added = Directory::new(Arc::clone(parent)).add(name, sector);
        if let Err(e) = added {
            self.free_map.free(sector);
            return Err(e);
        }

        if let Some(parent_sector) = dotdot {
            let child = self.table.open(sector)?;
            if let Err(e) = Directory::init_self_and_parent(&child, parent_sector) {
                self.table.close(sector)?;
                return Err(e);
            }
            self.table.close(sector)?;
        } else if initial_size > 0 {
            let child = self.table.open(sector)?;
            let n = child.write_at(0, &vec![0u8; initial_size as usize])?;
            self.table.close(sector)?;
            if (n as u64) < initial_size {
                return Err(KernelError::NoSpace);
            }
        }
        Ok(())
    }

    /// Opens `path`, returning an inode handle with `+1` reference; the
    /// caller must [`FileSystem::close`] it.
    pub fn open(&self, cwd: SectorId, path: &str) -> Result<Arc<Inode>> {
        match self.resolver.resolve(path, cwd)? {
            Resolved::Found(inode) => Ok(inode),
            Resolved::MissingLast { parent, .. } => {
                self.table.close(parent.sector())?;
                Err(KernelError::NotFound)
            }
        }
    }

    /// Releases one reference acquired by [`FileSystem::open`] or a prior
    /// resolution; see [`Inode`]'s uniqueness invariant.
    pub fn close(&self, inode: Arc<Inode>) -> Result<()> {
        let sector = inode.sector();
        drop(inode);
        self.table.close(sector)
    }

    /// Removes `path`. Removing a file whose inode is still open is legal;
    /// the on-disk deletion is deferred to last close (spec.md §4.7).
    pub fn remove(&self, cwd: SectorId, path: &str) -> Result<()> {
        let target = match self.resolver.resolve(path, cwd)? {
            Resolved::Found(inode) => inode,
            Resolved::MissingLast { parent, .. } => {
                self.table.close(parent.sector())?;
                return Err(KernelError::NotFound);
            }
        };
        let target_sector = target.sector();

        if target_sector == self.resolver.root_sector() {
            self.table.close(target_sector)?;
            return Err(KernelError::Denied);
        }
        if target.is_dir() {
            let dir = Directory::new(Arc::clone(&target));
            if !dir.is_empty()? {
                self.table.close(target_sector)?;
                return Err(KernelError::NotEmpty);
            }
        }

        let (parent_path, name) = split_parent(path);
        let parent = match self.resolver.resolve(&parent_path, cwd)? {
            Resolved::Found(inode) => inode,
            Resolved::MissingLast { parent, .. } => {
                self.table.close(parent.sector())?;
                self.table.close(target_sector)?;
                return Err(KernelError::NotFound);
            }
        };
        let remove_result = Directory::new(Arc::clone(&parent)).remove(&name);
        self.table.close(parent.sector())?;
        remove_result?;

        self.table.mark_removed(target_sector);
        self.table.close(target_sector)?;
        Ok(())
    }

    /// Changes `cwd` to `path`, returning the new directory's inode handle
    /// (the caller swaps it into its own CWD state and closes the old
    /// one).
    pub fn chdir(&self, cwd: SectorId, path: &str) -> Result<Arc<Inode>> {
        match self.resolver.resolve(path, cwd)? {
            Resolved::Found(inode) => {
                if !inode.is_dir() {
                    self.table.close(inode.sector())?;
                    return Err(KernelError::NotDirectory);
                }
                Ok(inode)
            }
            Resolved::MissingLast { parent, .. } => {
                self.table.close(parent.sector())?;
                Err(KernelError::NotFound)
            }
        }
    }

    /// Opens `path` as a directory handle for `readdir`.
    pub fn opendir(&self, cwd: SectorId, path: &str) -> Result<Directory> {
        let inode = self.open(cwd, path)?;
        if !inode.is_dir() {
            self.table.close(inode.sector())?;
            return Err(KernelError::NotDirectory);
        }
        Ok(Directory::new(inode))
    }

    pub fn exists(&self, cwd: SectorId, path: &str) -> Result<bool> {
        match self.resolver.resolve(path, cwd) {
            Ok(Resolved::Found(inode)) => {
                self.table.close(inode.sector())?;
                Ok(true)
            }
            Ok(Resolved::MissingLast { parent, .. }) => {
                self.table.close(parent.sector())?;
                Ok(false)
            }
            Err(KernelError::NotFound) | Err(KernelError::NotDirectory) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn isdir(&self, cwd: SectorId, path: &str) -> Result<bool> {
        match self.resolver.resolve(path, cwd)? {
            Resolved::Found(inode) => {
                let is_dir = inode.is_dir();
                self.table.close(inode.sector())?;
                Ok(is_dir)
            }
            Resolved::MissingLast { parent, .. } => {
                self.table.close(parent.sector())?;
                Err(KernelError::NotFound)
            }
        }
    }

    /// Byte length of an open file (supplements spec.md's distilled API
    /// surface with the `filesize` query the syscall surface in §6 needs).
    pub fn filesize(&self, inode: &Inode) -> u64 {
        inode.length()
    }

    pub fn is_removed(&self, sector: SectorId) -> bool {
        self.table.is_removed(sector)
    }

    pub fn deny_write(&self, sector: SectorId) {
        self.table.deny_write(sector)
    }

    pub fn allow_write(&self, sector: SectorId) {
        self.table.allow_write(sector)
    }

    pub fn write_denied(&self, sector: SectorId) -> bool {
        self.table.write_denied(sector)
    }

    pub fn cache(&self) -> &Arc<SectorCache> {
        &self.cache
    }

    /// The free-sector bitmap, for callers that want to observe allocation
    /// counts directly (e.g. tests asserting that delete-while-open frees
    /// its sectors once the last reference closes).
    pub fn free_map(&self) -> &Arc<FreeMap> {
        &self.free_map
    }

    /// The open-inode table, for callers (e.g. `strata-kernel`'s file
    /// descriptor adapters) that must close an [`Inode`] handle's
    /// reference once their own wrapper is dropped.
    pub fn table(&self) -> &Arc<InodeTable> {
        &self.table
    }

    /// Flushes the cache and persists the free map. Per spec.md §4.12's
    /// shutdown sequence (daemons are stopped by dropping the cache).
    pub fn shutdown(&self) -> Result<()> {
        self.cache.shutdown()?;
        self.free_map.sync()
    }
}

fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => {
            let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
            (parent.to_string(), trimmed[idx + 1..].to_string())
        }
        None => (String::new(), trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::facade::DeviceRole;
    use strata_core::testing::MemBlockDevice;

    fn fresh_fs(sectors: u32) -> FileSystem {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(sectors, DeviceRole::Filesys));
        FileSystem::format(dev, Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn create_open_read_write() {
        let fs = fresh_fs(1 << 15);
        let root = fs.root_sector();
        fs.create(root, "/big", 0).unwrap();
        let inode = fs.open(root, "/big").unwrap();
        inode.write_at(0, b"payload").unwrap();
        fs.close(inode).unwrap();
        assert!(fs.exists(root, "/big").unwrap());
    }

    #[test]
    fn directory_tree_scenario() {
        let fs = fresh_fs(1 << 15);
        let root = fs.root_sector();
        fs.mkdir(root, "/a").unwrap();
        fs.mkdir(root, "/a/b").unwrap();

        let a_inode = fs.chdir(root, "/a").unwrap();
        let a_sector = a_inode.sector();

        let mut dir = fs.opendir(a_sector, "").unwrap();
        assert_eq!(dir.readdir().unwrap(), Some("b".to_string()));
        assert_eq!(dir.readdir().unwrap(), None);

        assert_eq!(fs.remove(root, "/a").unwrap_err(), KernelError::NotEmpty);
        fs.remove(root, "/a/b").unwrap();
        fs.remove(root, "/a").unwrap();
        fs.close(a_inode).unwrap();
    }

    #[test]
    fn create_fails_if_exists() {
        let fs = fresh_fs(1 << 15);
        let root = fs.root_sector();
        fs.create(root, "/dup", 0).unwrap();
        assert_eq!(fs.create(root, "/dup", 0).unwrap_err(), KernelError::Exists);
    }

    #[test]
    fn removing_root_is_denied() {
        let fs = fresh_fs(1 << 15);
        let root = fs.root_sector();
        assert_eq!(fs.remove(root, "/").unwrap_err(), KernelError::Denied);
    }
}
