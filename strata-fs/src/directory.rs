//! Directory engine: name → inode entries with `.` and `..` (spec.md §4.5,
//! C5). A directory is a file whose payload is a packed array of
//! [`RawDirEntry`] records; this module never touches the sector cache
//! directly, going through [`Inode::read_at`]/[`Inode::write_at`] instead.
use std::sync::Arc;

use strata_core::error::{KernelError, Result};
use strata_core::facade::SectorId;

use crate::inode::Inode;
use crate::layout::RawDirEntry;

/// A directory handle: the underlying inode plus a readdir cursor.
pub struct Directory {
    inode: Arc<Inode>,
    cursor: u64,
}

impl Directory {
    pub fn new(inode: Arc<Inode>) -> Directory {
        Directory { inode, cursor: 0 }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Writes `.` and `..` as the first two entries of a freshly created
    /// directory (spec.md §4.5/§4.7).
    pub fn init_self_and_parent(inode: &Inode, parent_sector: SectorId) -> Result<()> {
        let dot = RawDirEntry::new(inode.sector().0, ".").expect("\".\" fits NAME_MAX");
        let dotdot = RawDirEntry::new(parent_sector.0, "..").expect("\"..\" fits NAME_MAX");
        write_entry(inode, 0, &dot)?;
        write_entry(inode, 1, &dotdot)?;
        Ok(())
    }

    /// Linearly scans for `name`, returning its inode sector if present.
    pub fn lookup(&self, name: &str) -> Result<Option<SectorId>> {
        let count = entry_count(&self.inode);
        for i in 0..count {
            if let Some(e) = read_entry(&self.inode, i)? {
                if e.is_in_use() && e.name_str() == name {
                    return Ok(Some(SectorId(e.inode_sector)));
                }
            }
        }
        Ok(None)
    }

    /// Inserts `name -> sector` into the first free slot, or appends.
    /// Fails with [`KernelError::Exists`] if `name` is already present.
    pub fn add(&self, name: &str, sector: SectorId) -> Result<()> {
        if self.lookup(name)?.is_some() {
            return Err(KernelError::Exists);
        }
        let entry = RawDirEntry::new(sector.0, name).ok_or(KernelError::InvalidArgument)?;

        let count = entry_count(&self.inode);
        for i in 0..count {
            let free = match read_entry(&self.inode, i)? {
                Some(e) => !e.is_in_use(),
                None => true,
            };
            if free {
                return write_entry(&self.inode, i, &entry);
            }
        }
        write_entry(&self.inode, count, &entry)
    }

    /// Marks `name`'s slot free. Does not compact the payload. Fails if
    /// `name` does not name an entry, or (checked by the caller, which
    /// knows whether the target is a directory and whether it is the
    /// root) if removal is otherwise disallowed.
    pub fn remove(&self, name: &str) -> Result<SectorId> {
        let count = entry_count(&self.inode);
        for i in 0..count {
            if let Some(e) = read_entry(&self.inode, i)? {
                if e.is_in_use() && e.name_str() == name {
                    write_entry(&self.inode, i, &RawDirEntry::empty())?;
                    return Ok(SectorId(e.inode_sector));
                }
            }
        }
        Err(KernelError::NotFound)
    }

    /// Whether this directory contains any entry besides `.` and `..`
    /// (spec.md §4.5: required to be empty before `remove`).
    pub fn is_empty(&self) -> Result<bool> {
        let count = entry_count(&self.inode);
        for i in 0..count {
            if let Some(e) = read_entry(&self.inode, i)? {
                if e.is_in_use() && e.name_str() != "." && e.name_str() != ".." {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Advances the cursor to the next in-use entry that is neither `.`
    /// nor `..`, returning its name. `None` at end-of-payload.
    pub fn readdir(&mut self) -> Result<Option<String>> {
        let count = entry_count(&self.inode);
        loop {
            if self.cursor >= count as u64 {
                return Ok(None);
            }
            let i = self.cursor as usize;
            self.cursor += 1;
            if let Some(e) = read_entry(&self.inode, i)? {
                if e.is_in_use() && e.name_str() != "." && e.name_str() != ".." {
                    return Ok(Some(e.name_str().to_string()));
                }
            }
        }
    }

    /// Rewinds the readdir cursor to the start of the payload.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

fn entry_count(inode: &Inode) -> usize {
    (inode.length() as usize) / core::mem::size_of::<RawDirEntry>()
}

fn read_entry(inode: &Inode, index: usize) -> Result<Option<RawDirEntry>> {
    let size = core::mem::size_of::<RawDirEntry>();
    let mut buf = vec![0u8; size];
    let n = inode.read_at((index * size) as u64, &mut buf)?;
    if n < size {
        return Ok(None);
    }
    let entry: RawDirEntry = *zerocopy::FromBytes::ref_from(&buf[..]).expect("dir-entry-sized buffer");
    Ok(Some(entry))
}

fn write_entry(inode: &Inode, index: usize, entry: &RawDirEntry) -> Result<()> {
    let size = core::mem::size_of::<RawDirEntry>();
    let bytes = zerocopy::AsBytes::as_bytes(entry);
    let n = inode.write_at((index * size) as u64, bytes)?;
    if n < size {
        return Err(KernelError::Io);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freemap::FreeMap;
    use crate::inode::InodeTable;
    use crate::layout::InodeKind;
    use std::time::Duration;
    use strata_core::facade::{BlockDevice, DeviceRole};
    use strata_core::testing::MemBlockDevice;

    fn setup() -> (InodeTable, Arc<FreeMap>) {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(1024, DeviceRole::Filesys));
        let cache = crate::cache::SectorCache::with_capacity(dev, 16, Duration::from_secs(3600));
        let free_map = Arc::new(FreeMap::format(Arc::clone(&cache), SectorId(5), 1024, &[SectorId(0), SectorId(2)]).unwrap());
        (InodeTable::new(cache, Arc::clone(&free_map)), free_map)
    }

    #[test]
    fn add_lookup_remove() {
        let (table, free_map) = setup();
        let root_sector = SectorId(2);
        table.create(root_sector, InodeKind::Dir).unwrap();
        let root_inode = table.open(root_sector).unwrap();
        Directory::init_self_and_parent(&root_inode, root_sector).unwrap();
        let root = Directory::new(Arc::clone(&root_inode));

        let child = free_map.allocate().unwrap();
        table.create(child, InodeKind::File).unwrap();
        root.add("foo.txt", child).unwrap();

        assert_eq!(root.lookup("foo.txt").unwrap(), Some(child));
        assert_eq!(root.remove("foo.txt").unwrap(), child);
        assert_eq!(root.lookup("foo.txt").unwrap(), None);
    }

    #[test]
    fn readdir_skips_dot_and_dotdot() {
        let (table, free_map) = setup();
        let root_sector = SectorId(2);
        table.create(root_sector, InodeKind::Dir).unwrap();
        let root_inode = table.open(root_sector).unwrap();
        Directory::init_self_and_parent(&root_inode, root_sector).unwrap();
        let mut root = Directory::new(Arc::clone(&root_inode));

        let a_sector = free_map.allocate().unwrap();
        table.create(a_sector, InodeKind::Dir).unwrap();
        root.add("a", a_sector).unwrap();

        assert_eq!(root.readdir().unwrap(), Some("a".to_string()));
        assert_eq!(root.readdir().unwrap(), None);
        root.rewind();
        assert_eq!(root.readdir().unwrap(), Some("a".to_string()));
    }

    #[test]
    fn add_reuses_slot_freed_by_remove() {
        let (table, free_map) = setup();
        let root_sector = SectorId(2);
        table.create(root_sector, InodeKind::Dir).unwrap();
        let root_inode = table.open(root_sector).unwrap();
        Directory::init_self_and_parent(&root_inode, root_sector).unwrap();
        let root = Directory::new(Arc::clone(&root_inode));

        let a = free_map.allocate().unwrap();
        table.create(a, InodeKind::File).unwrap();
        root.add("a", a).unwrap();
        root.remove("a").unwrap();
        let len_after_remove = root_inode.length();

        let b = free_map.allocate().unwrap();
        table.create(b, InodeKind::File).unwrap();
        root.add("b", b).unwrap();

        assert_eq!(root_inode.length(), len_after_remove, "add should reuse the freed slot, not grow the directory");
    }

    #[test]
    fn duplicate_name_rejected() {
        let (table, free_map) = setup();
        let root_sector = SectorId(2);
        table.create(root_sector, InodeKind::Dir).unwrap();
        let root_inode = table.open(root_sector).unwrap();
        Directory::init_self_and_parent(&root_inode, root_sector).unwrap();
        let root = Directory::new(root_inode);

        let a = free_map.allocate().unwrap();
        table.create(a, InodeKind::File).unwrap();
        root.add("dup", a).unwrap();

        let b = free_map.allocate().unwrap();
        table.create(b, InodeKind::File).unwrap();
        assert_eq!(root.add("dup", b).unwrap_err(), KernelError::Exists);
    }
}
