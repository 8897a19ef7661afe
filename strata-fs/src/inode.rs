//! Multi-level indexed inode engine (spec.md §4.4, C4).
//!
//! Grounded on the indexing documentation style of
//! `keos-project5/src/ffs/inode.rs` (`TrackedInode`/`get_inode`) and the
//! on-disk struct conventions of `disk_layout.rs`, reimplemented for the
//! cache-routed, lazy-indexed variant spec.md §9 standardizes on (as
//! opposed to the teacher's journaled, direct-to-device FFS).
use std::collections::HashMap;
use std::sync::Arc;

use strata_core::error::{KernelError, Result};
use strata_core::facade::SectorId;
use strata_core::sync::SpinLock;

use crate::cache::SectorCache;
use crate::constants::{MAX_FILE_SIZE, N_DIRECT, PTRS_PER_SECTOR, SECTOR_SIZE};
use crate::freemap::FreeMap;
use crate::layout::{InodeKind, RawInode};
use crate::sector_none;

/// Which block of an inode's index tree a byte offset falls in.
enum BlockLoc {
    Direct(usize),
    Indirect(usize),
    Double(usize, usize),
}

fn locate_block(block: usize) -> BlockLoc {
    if block < N_DIRECT {
        BlockLoc::Direct(block)
    } else if block < N_DIRECT + PTRS_PER_SECTOR {
        BlockLoc::Indirect(block - N_DIRECT)
    } else {
        let r = block - N_DIRECT - PTRS_PER_SECTOR;
        BlockLoc::Double(r / PTRS_PER_SECTOR, r % PTRS_PER_SECTOR)
    }
}

fn read_ptr_sector(cache: &SectorCache, sector: SectorId) -> Result<[u32; PTRS_PER_SECTOR]> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf)?;
    let mut ptrs = [0u32; PTRS_PER_SECTOR];
    for (i, chunk) in buf.chunks_exact(4).enumerate() {
        ptrs[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    Ok(ptrs)
}

fn write_ptr_sector(cache: &SectorCache, sector: SectorId, ptrs: &[u32; PTRS_PER_SECTOR]) -> Result<()> {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, p) in ptrs.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&p.to_le_bytes());
    }
    cache.write(sector, &buf)
}

fn empty_ptr_sector() -> [u32; PTRS_PER_SECTOR] {
    [sector_none(); PTRS_PER_SECTOR]
}

/// Mutable book-keeping the inode-module lock protects: table membership,
/// `open_cnt`, and `deny_write_cnt` (spec.md §4.4).
struct TableEntry {
    inode: Arc<Inode>,
    open_cnt: u32,
    deny_write_cnt: u32,
    removed: bool,
}

/// The process-wide open-inode table (spec.md §3: "at most one in-memory
/// inode per disk sector").
pub struct InodeTable {
    cache: Arc<SectorCache>,
    free_map: Arc<FreeMap>,
    entries: SpinLock<HashMap<u32, TableEntry>>,
}

impl InodeTable {
    pub fn new(cache: Arc<SectorCache>, free_map: Arc<FreeMap>) -> InodeTable {
        InodeTable {
            cache,
            free_map,
            entries: SpinLock::new(HashMap::new()),
        }
    }

    /// Initializes a freshly allocated sector as an inode of `kind`,
    /// without opening it.
    pub fn create(&self, sector: SectorId, kind: InodeKind) -> Result<()> {
        let raw = RawInode::init(kind);
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(zerocopy::AsBytes::as_bytes(&raw));
        self.cache.write(sector, &buf)
    }

    /// Opens (or reopens) the inode at `sector`, bumping `open_cnt`.
    pub fn open(&self, sector: SectorId) -> Result<Arc<Inode>> {
        let mut g = self.entries.lock();
        if let Some(e) = g.get_mut(&sector.0) {
            e.open_cnt += 1;
            let inode = Arc::clone(&e.inode);
            g.unlock();
            return Ok(inode);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        if let Err(e) = self.cache.read(sector, &mut buf) {
            g.unlock();
            return Err(e);
        }
        let raw: RawInode = *zerocopy::FromBytes::ref_from(&buf[..]).expect("sector-sized buffer");
        if !raw.is_valid() {
            g.unlock();
            return Err(KernelError::NotFound);
        }
        let inode = Arc::new(Inode {
            sector,
            cache: Arc::clone(&self.cache),
            free_map: Arc::clone(&self.free_map),
            disk: SpinLock::new(raw),
            index_lock: SpinLock::new(()),
        });
        g.insert(
            sector.0,
            TableEntry {
                inode: Arc::clone(&inode),
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
            },
        );
        g.unlock();
        Ok(inode)
    }

    /// Marks the inode at `sector` for deletion once `open_cnt` reaches
    /// zero (spec.md §4.7: "on-disk deletion is deferred to last close").
    pub fn mark_removed(&self, sector: SectorId) {
        let mut g = self.entries.lock();
        if let Some(e) = g.get_mut(&sector.0) {
            e.removed = true;
        }
        g.unlock();
    }

    pub fn is_removed(&self, sector: SectorId) -> bool {
        let g = self.entries.lock();
        let r = g.get(&sector.0).is_some_and(|e| e.removed);
        g.unlock();
        r
    }

    /// Forbids (or permits) writes to the inode at `sector`, used by the
    /// ELF loader to protect a running executable. Invariant:
    /// `0 <= deny_write_cnt <= open_cnt`.
    pub fn deny_write(&self, sector: SectorId) {
        let mut g = self.entries.lock();
        if let Some(e) = g.get_mut(&sector.0) {
            debug_assert!(e.deny_write_cnt < e.open_cnt);
            e.deny_write_cnt += 1;
        }
        g.unlock();
    }

    pub fn allow_write(&self, sector: SectorId) {
        let mut g = self.entries.lock();
        if let Some(e) = g.get_mut(&sector.0) {
            debug_assert!(e.deny_write_cnt > 0);
            e.deny_write_cnt -= 1;
        }
        g.unlock();
    }

    pub fn write_denied(&self, sector: SectorId) -> bool {
        let g = self.entries.lock();
        let r = g.get(&sector.0).is_some_and(|e| e.deny_write_cnt > 0);
        g.unlock();
        r
    }

    /// Closes one reference to the inode at `sector`. When `open_cnt`
    /// drops to zero, removes the in-memory table entry, deleting every
    /// owned sector first if the inode was marked removed.
    pub fn close(&self, sector: SectorId) -> Result<()> {
        let mut g = self.entries.lock();
        let should_delete = {
            let e = g.get_mut(&sector.0).ok_or(KernelError::NotFound)?;
            e.open_cnt -= 1;
            if e.open_cnt == 0 {
                let removed = e.removed;
                g.remove(&sector.0);
                removed
            } else {
                false
            }
        };
        g.unlock();
        if should_delete {
            self.delete_sectors(sector)?;
        }
        Ok(())
    }

    /// Walks the entire index tree releasing every data sector, then every
    /// index sector, then the inode sector itself (spec.md §4.4).
    fn delete_sectors(&self, sector: SectorId) -> Result<()> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.cache.read(sector, &mut buf)?;
        let raw: RawInode = *zerocopy::FromBytes::ref_from(&buf[..]).expect("sector-sized buffer");

        for i in 0..N_DIRECT {
            let p = SectorId(raw.blocks[i]);
            if p.is_some() {
                self.free_map.free(p);
            }
        }
        let indirect = SectorId(raw.blocks[N_DIRECT]);
        if indirect.is_some() {
            let ptrs = read_ptr_sector(&self.cache, indirect)?;
            for p in ptrs {
                let p = SectorId(p);
                if p.is_some() {
                    self.free_map.free(p);
                }
            }
            self.free_map.free(indirect);
        }
        let double = SectorId(raw.blocks[N_DIRECT + 1]);
        if double.is_some() {
            let outer = read_ptr_sector(&self.cache, double)?;
            for o in outer {
                let o = SectorId(o);
                if o.is_some() {
                    let inner = read_ptr_sector(&self.cache, o)?;
                    for p in inner {
                        let p = SectorId(p);
                        if p.is_some() {
                            self.free_map.free(p);
                        }
                    }
                    self.free_map.free(o);
                }
            }
            self.free_map.free(double);
        }
        self.free_map.free(sector);
        Ok(())
    }
}

/// An in-memory inode handle (spec.md §3).
pub struct Inode {
    sector: SectorId,
    cache: Arc<SectorCache>,
    free_map: Arc<FreeMap>,
    disk: SpinLock<RawInode>,
    /// Serializes allocate-on-demand through the indirect and
    /// double-indirect index sectors, so two threads growing the same
    /// inode into the same not-yet-allocated slot can't both allocate and
    /// have the second write clobber the first (spec.md §8's free-map
    /// invariant). The direct-block case needs no separate lock: `disk` is
    /// already held across its whole check-then-allocate-then-write.
    index_lock: SpinLock<()>,
}

impl Inode {
    pub fn sector(&self) -> SectorId {
        self.sector
    }

    pub fn length(&self) -> u64 {
        let g = self.disk.lock();
        let l = g.length as u64;
        g.unlock();
        l
    }

    pub fn kind(&self) -> InodeKind {
        let g = self.disk.lock();
        let k = g.kind().unwrap_or(InodeKind::File);
        g.unlock();
        k
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind(), InodeKind::Dir)
    }

    /// Reads up to `out.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read, short if `offset + out.len()` runs
    /// past `length`.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<usize> {
        let length = self.length();
        if offset >= length {
            return Ok(0);
        }
        let to_read = out.len().min((length - offset) as usize);
        let mut done = 0;
        while done < to_read {
            let pos = offset + done as u64;
            let block = (pos / SECTOR_SIZE as u64) as usize;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk_len = (SECTOR_SIZE - sector_ofs).min(to_read - done);
            let sector = self.block_sector(block, false)?;
            if sector.is_none() {
                break;
            }
            let mut buf = [0u8; SECTOR_SIZE];
            self.cache.read(sector, &mut buf)?;
            out[done..done + chunk_len].copy_from_slice(&buf[sector_ofs..sector_ofs + chunk_len]);
            done += chunk_len;
        }
        Ok(done)
    }

    /// Writes `data` at `offset`, growing the file (and its index tree) as
    /// needed. Returns the number of bytes actually written; an
    /// intermediate allocation failure returns fewer bytes than requested,
    /// leaving any sectors already allocated owned by the inode (spec.md
    /// §4.4: no rollback).
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if offset + data.len() as u64 > MAX_FILE_SIZE {
            return Err(KernelError::NoSpace);
        }
        let target_len = offset + data.len() as u64;
        if target_len > self.length() {
            self.grow_to(target_len)?;
        }

        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let block = (pos / SECTOR_SIZE as u64) as usize;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let chunk_len = (SECTOR_SIZE - sector_ofs).min(data.len() - done);

            let sector = match self.block_sector(block, true) {
                Ok(s) if s.is_some() => s,
                _ => break,
            };

            if chunk_len == SECTOR_SIZE {
                let mut buf = [0u8; SECTOR_SIZE];
                buf.copy_from_slice(&data[done..done + SECTOR_SIZE]);
                self.cache.write(sector, &buf)?;
            } else {
                let mut buf = [0u8; SECTOR_SIZE];
                self.cache.read(sector, &mut buf)?;
                buf[sector_ofs..sector_ofs + chunk_len].copy_from_slice(&data[done..done + chunk_len]);
                self.cache.write(sector, &buf)?;
            }
            done += chunk_len;
        }
        Ok(done)
    }

    /// Resolves block index `block` to a data sector. If `allocate` is
    /// true and the slot (or an index block it depends on) is unallocated,
    /// allocates lazily; otherwise returns [`SectorId::NONE`].
    fn block_sector(&self, block: usize, allocate: bool) -> Result<SectorId> {
        match locate_block(block) {
            BlockLoc::Direct(i) => {
                // Held across the whole check-then-allocate-then-write
                // sequence so two concurrent growers of the same inode
                // can't both see "unallocated" and both allocate.
                let mut g = self.disk.lock();
                let existing = SectorId(g.blocks[i]);
                if existing.is_some() || !allocate {
                    g.unlock();
                    return Ok(existing);
                }
                let fresh = match self.free_map.allocate() {
                    Ok(f) => f,
                    Err(e) => {
                        g.unlock();
                        return Err(e);
                    }
                };
                g.blocks[i] = fresh.0;
                let persisted = self.persist(&g);
                g.unlock();
                persisted?;
                Ok(fresh)
            }
            BlockLoc::Indirect(i) => self.resolve_via_index(N_DIRECT, i, allocate),
            BlockLoc::Double(outer, inner) => {
                let outer_sector = self.ensure_index(N_DIRECT + 1, allocate)?;
                if outer_sector.is_none() {
                    return Ok(SectorId::NONE);
                }
                if !allocate {
                    let ptrs = read_ptr_sector(&self.cache, outer_sector)?;
                    let inner_sector = SectorId(ptrs[outer]);
                    if inner_sector.is_none() {
                        return Ok(SectorId::NONE);
                    }
                    let inner_ptrs = read_ptr_sector(&self.cache, inner_sector)?;
                    return Ok(SectorId(inner_ptrs[inner]));
                }
                // `index_lock` is held across reading both levels of
                // pointer sectors and any allocation they trigger, so a
                // concurrent grower targeting the same outer/inner slot
                // can't allocate a second sector into it.
                let lock = self.index_lock.lock();
                let mut ptrs = match read_ptr_sector(&self.cache, outer_sector) {
                    Ok(p) => p,
                    Err(e) => {
                        lock.unlock();
                        return Err(e);
                    }
                };
                let mut inner_sector = SectorId(ptrs[outer]);
                if inner_sector.is_none() {
                    inner_sector = match self.free_map.allocate() {
                        Ok(s) => s,
                        Err(e) => {
                            lock.unlock();
                            return Err(e);
                        }
                    };
                    if let Err(e) = write_ptr_sector(&self.cache, inner_sector, &empty_ptr_sector()) {
                        lock.unlock();
                        return Err(e);
                    }
                    ptrs[outer] = inner_sector.0;
                    if let Err(e) = write_ptr_sector(&self.cache, outer_sector, &ptrs) {
                        lock.unlock();
                        return Err(e);
                    }
                }
                let mut inner_ptrs = match read_ptr_sector(&self.cache, inner_sector) {
                    Ok(p) => p,
                    Err(e) => {
                        lock.unlock();
                        return Err(e);
                    }
                };
                let existing = SectorId(inner_ptrs[inner]);
                if existing.is_some() {
                    lock.unlock();
                    return Ok(existing);
                }
                let fresh = match self.free_map.allocate() {
                    Ok(f) => f,
                    Err(e) => {
                        lock.unlock();
                        return Err(e);
                    }
                };
                inner_ptrs[inner] = fresh.0;
                let wrote = write_ptr_sector(&self.cache, inner_sector, &inner_ptrs);
                lock.unlock();
                wrote?;
                Ok(fresh)
            }
        }
    }

    /// Ensures `blocks[slot]` (the indirect or double-indirect pointer)
    /// points at an allocated, zero-initialized index sector. `disk` is
    /// held across the whole check-then-allocate-then-write sequence for
    /// the same reason as the direct-block case.
    fn ensure_index(&self, slot: usize, allocate: bool) -> Result<SectorId> {
        let mut g = self.disk.lock();
        let existing = SectorId(g.blocks[slot]);
        if existing.is_some() || !allocate {
            g.unlock();
            return Ok(existing);
        }
        let fresh = match self.free_map.allocate() {
            Ok(f) => f,
            Err(e) => {
                g.unlock();
                return Err(e);
            }
        };
        if let Err(e) = write_ptr_sector(&self.cache, fresh, &empty_ptr_sector()) {
            g.unlock();
            return Err(e);
        }
        g.blocks[slot] = fresh.0;
        let persisted = self.persist(&g);
        g.unlock();
        persisted?;
        Ok(fresh)
    }

    /// Resolves a single-indirect block. See [`Inode::block_sector`]'s
    /// `Double` arm for why allocation holds `index_lock` across the whole
    /// read-check-allocate-write sequence.
    fn resolve_via_index(&self, slot: usize, offset: usize, allocate: bool) -> Result<SectorId> {
        let index_sector = self.ensure_index(slot, allocate)?;
        if index_sector.is_none() {
            return Ok(SectorId::NONE);
        }
        if !allocate {
            let ptrs = read_ptr_sector(&self.cache, index_sector)?;
            return Ok(SectorId(ptrs[offset]));
        }
        let lock = self.index_lock.lock();
        let mut ptrs = match read_ptr_sector(&self.cache, index_sector) {
            Ok(p) => p,
            Err(e) => {
                lock.unlock();
                return Err(e);
            }
        };
        let existing = SectorId(ptrs[offset]);
        if existing.is_some() {
            lock.unlock();
            return Ok(existing);
        }
        let fresh = match self.free_map.allocate() {
            Ok(f) => f,
            Err(e) => {
                lock.unlock();
                return Err(e);
            }
        };
        ptrs[offset] = fresh.0;
        let wrote = write_ptr_sector(&self.cache, index_sector, &ptrs);
        lock.unlock();
        wrote?;
        Ok(fresh)
    }

    /// Bumps `length` to `new_len` without allocating data sectors
    /// directly; data sectors are allocated lazily by
    /// [`Inode::block_sector`] as `write_at` touches each block.
    fn grow_to(&self, new_len: u64) -> Result<()> {
        let mut g = self.disk.lock();
        if new_len > g.length as u64 {
            g.length = new_len as u32;
            self.persist(&g)?;
        }
        g.unlock();
        Ok(())
    }

    fn persist(&self, raw: &RawInode) -> Result<()> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(zerocopy::AsBytes::as_bytes(raw));
        self.cache.write(self.sector, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::facade::{BlockDevice, DeviceRole};
    use strata_core::testing::MemBlockDevice;

    fn fresh_table(sectors: u32) -> (InodeTable, Arc<FreeMap>) {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(sectors, DeviceRole::Filesys));
        let cache = SectorCache::with_capacity(dev, 16, Duration::from_secs(3600));
        let free_map = Arc::new(FreeMap::format(Arc::clone(&cache), SectorId(5), sectors, &[SectorId(0), SectorId(2)]).unwrap());
        (InodeTable::new(cache, Arc::clone(&free_map)), free_map)
    }

    #[test]
    fn create_open_read_write_roundtrip() {
        let (table, free_map) = fresh_table(1024);
        let sector = free_map.allocate().unwrap();
        table.create(sector, InodeKind::File).unwrap();
        let inode = table.open(sector).unwrap();

        let written = inode.write_at(0, b"hello world").unwrap();
        assert_eq!(written, 11);
        assert_eq!(inode.length(), 11);

        let mut buf = [0u8; 11];
        let read = inode.read_at(0, &mut buf).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");

        table.close(sector).unwrap();
    }

    #[test]
    fn growth_allocates_double_indirect_region() {
        let (table, free_map) = fresh_table(1 << 16);
        let sector = free_map.allocate().unwrap();
        table.create(sector, InodeKind::File).unwrap();
        let inode = table.open(sector).unwrap();

        let offset = 4 * 1024 * 1024u64;
        inode.write_at(offset, &[0xA5]).unwrap();
        assert_eq!(inode.length(), offset + 1);

        let mut out = [0u8; 1];
        inode.read_at(offset, &mut out).unwrap();
        assert_eq!(out[0], 0xA5);

        table.close(sector).unwrap();
    }

    #[test]
    fn delete_while_open_defers_to_last_close() {
        let (table, free_map) = fresh_table(1024);
        let sector = free_map.allocate().unwrap();
        table.create(sector, InodeKind::File).unwrap();
        let a = table.open(sector).unwrap();
        let b = table.open(sector).unwrap();

        table.mark_removed(sector);
        let before = free_map.count_allocated();

        a.write_at(0, b"abc").unwrap();
        let mut buf = [0u8; 3];
        b.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");

        table.close(sector).unwrap();
        assert_eq!(free_map.count_allocated(), before);
        table.close(sector).unwrap();
        assert!(free_map.count_allocated() < before);
    }

    #[test]
    fn short_read_past_length() {
        let (table, free_map) = fresh_table(1024);
        let sector = free_map.allocate().unwrap();
        table.create(sector, InodeKind::File).unwrap();
        let inode = table.open(sector).unwrap();
        inode.write_at(0, b"ab").unwrap();

        let mut buf = [0xffu8; 8];
        let n = inode.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 2);
        table.close(sector).unwrap();
    }

    /// Many threads growing the same inode into the same not-yet-allocated
    /// single-indirect block must allocate exactly one index sector and one
    /// data sector between them, never two of either (spec.md §8: every
    /// allocated sector is referenced by exactly one inode).
    #[test]
    fn concurrent_growth_into_same_indirect_block_allocates_once() {
        let (table, free_map) = fresh_table(1 << 14);
        let sector = free_map.allocate().unwrap();
        table.create(sector, InodeKind::File).unwrap();
        let inode = table.open(sector).unwrap();

        let pos = (N_DIRECT as u64) * SECTOR_SIZE as u64;
        let before = free_map.count_allocated();

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let inode = Arc::clone(&inode);
                std::thread::spawn(move || {
                    inode.write_at(pos, &[0x42]).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        // One index sector plus one data sector, regardless of how many
        // threads raced to allocate them.
        assert_eq!(free_map.count_allocated(), before + 2);

        let mut out = [0u8; 1];
        inode.read_at(pos, &mut out).unwrap();
        assert_eq!(out[0], 0x42);

        table.close(sector).unwrap();
    }

    /// Same race, one level deeper: the same not-yet-allocated
    /// double-indirect outer and inner slots must still resolve to exactly
    /// one outer index sector, one inner index sector, and one data sector.
    #[test]
    fn concurrent_growth_into_same_double_indirect_block_allocates_once() {
        let (table, free_map) = fresh_table(1 << 16);
        let sector = free_map.allocate().unwrap();
        table.create(sector, InodeKind::File).unwrap();
        let inode = table.open(sector).unwrap();

        let pos = ((N_DIRECT + PTRS_PER_SECTOR) as u64) * SECTOR_SIZE as u64;
        let before = free_map.count_allocated();

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let inode = Arc::clone(&inode);
                std::thread::spawn(move || {
                    inode.write_at(pos, &[0x7e]).unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(free_map.count_allocated(), before + 3);

        let mut out = [0u8; 1];
        inode.read_at(pos, &mut out).unwrap();
        assert_eq!(out[0], 0x7e);

        table.close(sector).unwrap();
    }
}
