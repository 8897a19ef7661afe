//! Per-process virtual-memory state: the file-descriptor table and the
//! mmap region list (spec.md §4.11, C11).
use std::collections::HashMap;
use std::sync::Arc;

use strata_core::error::{KernelError, Result};
use strata_core::facade::{PageDirId, SectorId, VirtAddr};
use strata_core::sync::SpinLock;

use crate::constants::PGSIZE;
use crate::file::{DirHandle, PageBackedFile};
use crate::frame::FrameTable;
use crate::spt::SupplementalPageTable;
use crate::spte::Location;

/// stdin/stdout occupy fds 0 and 1; the first file a process opens gets 2
/// (spec.md §4.11).
pub const FD_STDIN: i32 = 0;
pub const FD_STDOUT: i32 = 1;
const FIRST_USER_FD: i32 = 2;

enum FdEntry {
    File(Arc<dyn PageBackedFile>),
    Dir(SpinLock<Box<dyn DirHandle>>),
}

/// One active `mmap` mapping: a contiguous run of pages in a process's
/// address space backed by a single file.
pub struct MmapRegion {
    pub mapid: i32,
    pub user_base: VirtAddr,
    pub file: Arc<dyn PageBackedFile>,
    pub page_count: usize,
}

/// Per-process VM state: its supplemental page table, open-file table, and
/// active mmap regions. One instance per user process.
pub struct ProcessVm {
    pub spt: SupplementalPageTable,
    pub pagedir: PageDirId,
    fds: SpinLock<HashMap<i32, FdEntry>>,
    next_fd: SpinLock<i32>,
    mmaps: SpinLock<Vec<MmapRegion>>,
    next_mapid: SpinLock<i32>,
    cwd: SpinLock<SectorId>,
}

impl ProcessVm {
    pub fn new(pagedir: PageDirId, root_sector: SectorId) -> ProcessVm {
        ProcessVm {
            spt: SupplementalPageTable::new(),
            pagedir,
            fds: SpinLock::new(HashMap::new()),
            next_fd: SpinLock::new(FIRST_USER_FD),
            mmaps: SpinLock::new(Vec::new()),
            next_mapid: SpinLock::new(0),
            cwd: SpinLock::new(root_sector),
        }
    }

    pub fn cwd(&self) -> SectorId {
        let g = self.cwd.lock();
        let s = *g;
        g.unlock();
        s
    }

    pub fn set_cwd(&self, sector: SectorId) {
        let mut g = self.cwd.lock();
        *g = sector;
        g.unlock();
    }

    /// Installs an open file, returning the fd assigned to it.
    pub fn open_file(&self, file: Arc<dyn PageBackedFile>) -> i32 {
        self.install_fd(FdEntry::File(file))
    }

    /// Installs an open directory handle, returning the fd assigned to it.
    pub fn open_dir(&self, dir: Box<dyn DirHandle>) -> i32 {
        self.install_fd(FdEntry::Dir(SpinLock::new(dir)))
    }

    fn install_fd(&self, entry: FdEntry) -> i32 {
        let mut next = self.next_fd.lock();
        let fd = *next;
        *next += 1;
        next.unlock();

        let mut g = self.fds.lock();
        g.insert(fd, entry);
        g.unlock();
        fd
    }

    pub fn file(&self, fd: i32) -> Result<Arc<dyn PageBackedFile>> {
        let g = self.fds.lock();
        let r = match g.get(&fd) {
            Some(FdEntry::File(f)) => Ok(Arc::clone(f)),
            Some(FdEntry::Dir(_)) => Err(KernelError::IsDirectory),
            None => Err(KernelError::NotFound),
        };
        g.unlock();
        r
    }

    pub fn readdir(&self, fd: i32) -> Result<Option<String>> {
        let g = self.fds.lock();
        let r = match g.get(&fd) {
            Some(FdEntry::Dir(d)) => {
                let mut dg = d.lock();
                let name = dg.readdir();
                dg.unlock();
                name
            }
            Some(FdEntry::File(_)) => Err(KernelError::NotDirectory),
            None => Err(KernelError::NotFound),
        };
        g.unlock();
        r
    }

    /// Closes `fd`. Closing an unknown fd is a no-op, matching the
    /// teacher kernel's `sys_close`.
    pub fn close_fd(&self, fd: i32) {
        let mut g = self.fds.lock();
        g.remove(&fd);
        g.unlock();
    }

    /// Maps `file` at `addr`, one SPTE per page, lazily faulted in as
    /// `FILESYS` (spec.md §4.11). Rejects misaligned addresses, a zero-byte
    /// file, and any overlap with an existing mapping.
    pub fn mmap(&self, addr: VirtAddr, file: Arc<dyn PageBackedFile>) -> Result<i32> {
        if addr.0 == 0 || !addr.is_page_aligned(PGSIZE) {
            return Err(KernelError::InvalidArgument);
        }
        let length = file.length();
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = (length as usize).div_ceil(PGSIZE);
        if self.spt.overlaps(addr, page_count) {
            return Err(KernelError::InvalidArgument);
        }

        for i in 0..page_count {
            let vaddr = VirtAddr(addr.0 + i * PGSIZE);
            let offset = (i * PGSIZE) as u64;
            let remaining = length - offset;
            let read_bytes = (remaining as usize).min(PGSIZE);
            let zero_bytes = PGSIZE - read_bytes;
            self.spt
                .map_file(Arc::clone(&file), offset, vaddr, read_bytes, zero_bytes, true, Location::Filesys);
        }

        let mut next = self.next_mapid.lock();
        let mapid = *next;
        *next += 1;
        next.unlock();

        let mut g = self.mmaps.lock();
        g.push(MmapRegion {
            mapid,
            user_base: addr,
            file,
            page_count,
        });
        g.unlock();
        Ok(mapid)
    }

    /// Unmaps `mapid`: writes back every dirty resident page, removes the
    /// SPTEs, and frees their frames (spec.md §4.11).
    pub fn munmap(&self, mapid: i32, frame_table: &FrameTable) -> Result<()> {
        let region = {
            let mut g = self.mmaps.lock();
            let pos = g.iter().position(|r| r.mapid == mapid);
            let region = pos.map(|i| g.remove(i));
            g.unlock();
            region.ok_or(KernelError::InvalidArgument)?
        };

        for i in 0..region.page_count {
            let vaddr = VirtAddr(region.user_base.0 + i * PGSIZE);
            let Some(spte) = self.spt.remove(vaddr) else { continue };
            let snap = spte.snapshot();
            if snap.location == Location::Mmapped {
                if let Some(frame) = snap.frame {
                    let mut buf = [0u8; PGSIZE];
                    frame_table.read(frame, &mut buf);
                    region.file.write_at(snap.file_offset, &buf[..snap.read_bytes])?;
                    frame_table.free(frame);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use strata_core::facade::{Mmu, ThreadId};
    use strata_core::testing::MockMmu;

    struct MemFile {
        data: SpinLock<Vec<u8>>,
    }

    impl PageBackedFile for MemFile {
        fn length(&self) -> u64 {
            let g = self.data.lock();
            let n = g.len() as u64;
            g.unlock();
            n
        }
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let g = self.data.lock();
            let off = offset as usize;
            let n = buf.len().min(g.len().saturating_sub(off));
            buf[..n].copy_from_slice(&g[off..off + n]);
            g.unlock();
            Ok(n)
        }
        fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
            let mut g = self.data.lock();
            let off = offset as usize;
            if g.len() < off + data.len() {
                g.resize(off + data.len(), 0);
            }
            g[off..off + data.len()].copy_from_slice(data);
            g.unlock();
            Ok(data.len())
        }
    }

    #[test]
    fn fd_allocation_starts_at_two() {
        let mmu = StdArc::new(MockMmu::new());
        let pd = mmu.create_pagedir();
        let vm = ProcessVm::new(pd, SectorId(2));
        let file: Arc<dyn PageBackedFile> = StdArc::new(MemFile { data: SpinLock::new(vec![1, 2, 3]) });
        let fd = vm.open_file(Arc::clone(&file));
        assert_eq!(fd, FIRST_USER_FD);
        vm.close_fd(fd);
        assert!(vm.file(fd).is_err());
    }

    #[test]
    fn mmap_rejects_misaligned_address() {
        let mmu = StdArc::new(MockMmu::new());
        let pd = mmu.create_pagedir();
        let vm = ProcessVm::new(pd, SectorId(2));
        let file: Arc<dyn PageBackedFile> = StdArc::new(MemFile { data: SpinLock::new(vec![1, 2, 3]) });
        assert_eq!(vm.mmap(VirtAddr(0x1001), file).unwrap_err(), KernelError::InvalidArgument);
    }

    #[test]
    fn mmap_then_munmap_writes_back_dirty_pages() {
        let mmu = StdArc::new(MockMmu::new());
        let pd = mmu.create_pagedir();
        let swap_dev: Arc<dyn strata_core::facade::BlockDevice> =
            StdArc::new(strata_core::testing::MemBlockDevice::new(64, strata_core::facade::DeviceRole::Swap));
        let swap = crate::swap::SwapStore::new(swap_dev);
        let frame_table = FrameTable::new(mmu, 4);
        let vm = ProcessVm::new(pd, SectorId(2));
        let file: Arc<dyn PageBackedFile> = StdArc::new(MemFile {
            data: SpinLock::new(vec![0u8; PGSIZE]),
        });
        let base = VirtAddr(0x4000_0000);
        let mapid = vm.mmap(base, Arc::clone(&file)).unwrap();

        // Fault the page in and dirty it, as if a write occurred, so
        // munmap's write-back branch (which only fires for `Mmapped`) has
        // something to exercise.
        let spte = vm.spt.lookup(base).unwrap();
        let guard = spte.lock();
        let snap = guard.snapshot();
        assert_eq!(snap.location, Location::Filesys);
        let frame = frame_table.alloc(Arc::clone(&spte), pd, base, ThreadId(1), true, &swap).unwrap();
        let dirty = vec![0x5a; PGSIZE];
        frame_table.fill(frame, &dirty);
        guard.resolve_to_mmapped(frame);

        vm.munmap(mapid, &frame_table).unwrap();
        assert!(vm.spt.lookup(base).is_none());

        let mut out = [0u8; PGSIZE];
        file.read_at(0, &mut out).unwrap();
        assert_eq!(&out[..], &dirty[..]);
    }

    #[test]
    fn overlapping_mmap_is_rejected() {
        let mmu = StdArc::new(MockMmu::new());
        let pd = mmu.create_pagedir();
        let vm = ProcessVm::new(pd, SectorId(2));
        let file_a: Arc<dyn PageBackedFile> = StdArc::new(MemFile {
            data: SpinLock::new(vec![0u8; PGSIZE * 2]),
        });
        let file_b: Arc<dyn PageBackedFile> = StdArc::new(MemFile { data: SpinLock::new(vec![0u8; PGSIZE]) });
        let base = VirtAddr(0x5000_0000);
        vm.mmap(base, file_a).unwrap();
        assert_eq!(vm.mmap(VirtAddr(base.0 + PGSIZE), file_b).unwrap_err(), KernelError::InvalidArgument);
    }
}
