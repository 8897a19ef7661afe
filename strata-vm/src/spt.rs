//! Supplemental page table: per-process map from page-aligned user virtual
//! addresses to SPTEs, and fault resolution (spec.md §4.10, C10).
use std::collections::HashMap;
use std::sync::Arc;

use strata_core::error::Result;
use strata_core::facade::{PageDirId, ThreadId, VirtAddr};
use strata_core::sync::RwLock;

use crate::constants::{PGSIZE, STACK_GROWTH_SLACK};
use crate::file::PageBackedFile;
use crate::frame::FrameTable;
use crate::spte::{Location, Spte};
use crate::swap::SwapStore;

/// The outcome of resolving a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was resolved; the faulting instruction may be retried.
    Resolved,
    /// Unresolvable; the caller must kill the process with status `-1`
    /// (spec.md §4.10/§7).
    Kill,
}

/// Per-process SPTE map.
pub struct SupplementalPageTable {
    table: RwLock<HashMap<VirtAddr, Arc<Spte>>>,
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        SupplementalPageTable {
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, vaddr: VirtAddr) -> Option<Arc<Spte>> {
        let page = vaddr.page_floor(PGSIZE);
        let g = self.table.read();
        let r = g.get(&page).cloned();
        g.unlock();
        r
    }

    fn insert(&self, spte: Arc<Spte>) {
        let mut g = self.table.write();
        g.insert(spte.vaddr(), spte);
        g.unlock();
    }

    pub fn remove(&self, vaddr: VirtAddr) -> Option<Arc<Spte>> {
        let page = vaddr.page_floor(PGSIZE);
        let mut g = self.table.write();
        let r = g.remove(&page);
        g.unlock();
        r
    }

    /// Whether any page in `[base, base + page_count*PGSIZE)` already has
    /// an SPTE — used by `mmap`'s disjointness check (spec.md §4.11).
    pub fn overlaps(&self, base: VirtAddr, page_count: usize) -> bool {
        let g = self.table.read();
        let overlap = (0..page_count).any(|i| g.contains_key(&VirtAddr(base.0 + i * PGSIZE)));
        g.unlock();
        overlap
    }

    /// Eagerly materializes a new, writable-or-not anonymous page, zeroed,
    /// with a frame already assigned.
    pub fn alloc(
        &self,
        vaddr: VirtAddr,
        writable: bool,
        frame_table: &FrameTable,
        swap: &SwapStore,
        pagedir: PageDirId,
        owner: ThreadId,
    ) -> Result<Arc<Spte>> {
        let page = vaddr.page_floor(PGSIZE);
        let placeholder = Spte::zero(page, writable);
        let frame = frame_table.alloc(Arc::clone(&placeholder), pagedir, page, owner, writable, swap)?;
        placeholder.resolve_to_memory(frame);
        self.insert(Arc::clone(&placeholder));
        Ok(placeholder)
    }

    /// Registers a lazily-loaded file-backed page: `EXEC` for a loadable
    /// segment, `FILESYS` for an mmap'd page.
    #[allow(clippy::too_many_arguments)]
    pub fn map_file(
        &self,
        file: Arc<dyn PageBackedFile>,
        offset: u64,
        vaddr: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        kind: Location,
    ) -> Arc<Spte> {
        let page = vaddr.page_floor(PGSIZE);
        let spte = Spte::file_backed(page, file, offset, read_bytes, zero_bytes, writable, kind);
        self.insert(Arc::clone(&spte));
        spte
    }

    /// Registers an all-zero BSS-like page, materialized lazily on fault.
    pub fn mark_zero(&self, vaddr: VirtAddr, writable: bool) -> Arc<Spte> {
        let page = vaddr.page_floor(PGSIZE);
        let spte = Spte::zero(page, writable);
        self.insert(Arc::clone(&spte));
        spte
    }

    /// Resolves a page fault at `fault_addr` with stack pointer `esp`.
    /// `stack_limit` is the lowest address a stack-growth fault may
    /// allocate (spec.md §4.10).
    #[allow(clippy::too_many_arguments)]
    pub fn pull(
        &self,
        esp: usize,
        fault_addr: VirtAddr,
        is_write: bool,
        frame_table: &FrameTable,
        swap: &SwapStore,
        pagedir: PageDirId,
        owner: ThreadId,
        stack_limit: usize,
    ) -> Result<FaultOutcome> {
        let page = fault_addr.page_floor(PGSIZE);

        let spte = match self.lookup(page) {
            Some(s) => s,
            None => {
                let is_stack_growth = fault_addr.0 >= stack_limit && fault_addr.0 + STACK_GROWTH_SLACK >= esp;
                if !is_stack_growth {
                    return Ok(FaultOutcome::Kill);
                }
                self.alloc(page, true, frame_table, swap, pagedir, owner)?;
                return Ok(FaultOutcome::Resolved);
            }
        };

        // Held from the snapshot through the terminal resolve call, so a
        // second thread faulting this same SPTE blocks here rather than
        // racing this one to `frame_table.alloc` (spec.md §5).
        let guard = spte.lock();
        let snap = guard.snapshot();
        if is_write && !snap.writable {
            guard.release();
            return Ok(FaultOutcome::Kill);
        }

        match snap.location {
            Location::Memory => {
                guard.release();
                Ok(FaultOutcome::Resolved)
            }
            Location::Error => {
                guard.release();
                Ok(FaultOutcome::Kill)
            }
            Location::Zero => {
                let frame = match frame_table.alloc(Arc::clone(&spte), pagedir, page, owner, snap.writable, swap) {
                    Ok(f) => f,
                    Err(e) => {
                        guard.release();
                        return Err(e);
                    }
                };
                guard.resolve_to_memory(frame);
                Ok(FaultOutcome::Resolved)
            }
            Location::Swap => {
                let frame = match frame_table.alloc(Arc::clone(&spte), pagedir, page, owner, snap.writable, swap) {
                    Ok(f) => f,
                    Err(e) => {
                        guard.release();
                        return Err(e);
                    }
                };
                let slot = snap.swap_index.expect("Swap SPTE carries a slot");
                let mut buf = [0u8; PGSIZE];
                if let Err(e) = swap.reclaim(slot, &mut buf) {
                    guard.release();
                    return Err(e);
                }
                frame_table.fill(frame, &buf);
                swap.free(slot);
                guard.resolve_to_memory(frame);
                Ok(FaultOutcome::Resolved)
            }
            Location::Exec => {
                let frame = match frame_table.alloc(Arc::clone(&spte), pagedir, page, owner, snap.writable, swap) {
                    Ok(f) => f,
                    Err(e) => {
                        guard.release();
                        return Err(e);
                    }
                };
                let file = snap.file.clone().expect("Exec SPTE carries a file");
                let mut buf = vec![0u8; snap.read_bytes];
                if let Err(e) = file.read_at(snap.file_offset, &mut buf) {
                    guard.release();
                    return Err(e);
                }
                frame_table.fill(frame, &buf);
                // Future eviction uses swap, not the executable (spec.md
                // §4.10: "so that future eviction uses swap").
                guard.resolve_to_memory(frame);
                Ok(FaultOutcome::Resolved)
            }
            Location::Filesys | Location::Mmapped => {
                let frame = match frame_table.alloc(Arc::clone(&spte), pagedir, page, owner, snap.writable, swap) {
                    Ok(f) => f,
                    Err(e) => {
                        guard.release();
                        return Err(e);
                    }
                };
                if let Some(file) = &snap.file {
                    let mut buf = vec![0u8; snap.read_bytes];
                    if let Err(e) = file.read_at(snap.file_offset, &mut buf) {
                        guard.release();
                        return Err(e);
                    }
                    frame_table.fill(frame, &buf);
                }
                guard.resolve_to_mmapped(frame);
                Ok(FaultOutcome::Resolved)
            }
        }
    }

    /// Releases every SPTE's resources on process exit (spec.md §4.10).
    /// Mmap regions must be written back via `munmap` *before* this runs;
    /// this only frees frames/slots, it does not flush dirty `Mmapped`
    /// pages.
    pub fn destroy(&self, frame_table: &FrameTable, swap: &SwapStore) {
        let mut g = self.table.write();
        for (_, spte) in g.drain() {
            let snap = spte.snapshot();
            match snap.location {
                Location::Memory | Location::Mmapped => {
                    if let Some(f) = snap.frame {
                        frame_table.free(f);
                    }
                }
                Location::Swap => {
                    if let Some(s) = snap.swap_index {
                        swap.free(s);
                    }
                }
                Location::Zero | Location::Exec | Location::Filesys | Location::Error => {}
            }
        }
        g.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PHYS_BASE;
    use std::sync::Arc as StdArc;
    use strata_core::facade::{DeviceRole, Mmu, SectorId};
    use strata_core::testing::{MemBlockDevice, MockMmu};

    fn env() -> (SupplementalPageTable, FrameTable, SwapStore, PageDirId, ThreadId) {
        let mmu = StdArc::new(MockMmu::new());
        let pd = mmu.create_pagedir();
        let frame_table = FrameTable::new(mmu, 4);
        let dev: StdArc<dyn strata_core::facade::BlockDevice> = StdArc::new(MemBlockDevice::new(64, DeviceRole::Swap));
        let swap = SwapStore::new(dev);
        (SupplementalPageTable::new(), frame_table, swap, pd, ThreadId(1))
    }

    #[test]
    fn stack_growth_within_slack_allocates() {
        let (spt, ft, swap, pd, tid) = env();
        let esp = 0xbffffe00usize;
        let fault = VirtAddr(0xbffffdfc);
        let outcome = spt.pull(esp, fault, true, &ft, &swap, pd, tid, crate::constants::STACK_LIMIT).unwrap();
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(spt.lookup(fault).is_some());
    }

    #[test]
    fn fault_far_below_esp_is_killed() {
        let (spt, ft, swap, pd, tid) = env();
        let esp = 0xbffffe00usize;
        let fault = VirtAddr(esp - 4096);
        let outcome = spt.pull(esp, fault, true, &ft, &swap, pd, tid, crate::constants::STACK_LIMIT).unwrap();
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn write_to_read_only_page_is_killed() {
        let (spt, ft, swap, pd, tid) = env();
        let vaddr = VirtAddr(PHYS_BASE - 0x10_0000);
        spt.mark_zero(vaddr, false);
        let outcome = spt.pull(0, vaddr, true, &ft, &swap, pd, tid, crate::constants::STACK_LIMIT).unwrap();
        assert_eq!(outcome, FaultOutcome::Kill);
    }

    #[test]
    fn zero_page_faults_to_memory() {
        let (spt, ft, swap, pd, tid) = env();
        let vaddr = VirtAddr(PHYS_BASE - 0x10_0000);
        spt.mark_zero(vaddr, true);
        let outcome = spt.pull(0, vaddr, false, &ft, &swap, pd, tid, crate::constants::STACK_LIMIT).unwrap();
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert_eq!(spt.lookup(vaddr).unwrap().location(), Location::Memory);
    }

    /// Two threads faulting the same `Zero` SPTE for the first time must
    /// resolve to exactly one frame between them, never two (spec.md §8:
    /// "for every SPTE with location = MEMORY: exactly one frame-table
    /// entry refers to it").
    #[test]
    fn concurrent_fault_on_same_spte_allocates_one_frame() {
        let (spt, ft, swap, pd, tid) = env();
        let spt = StdArc::new(spt);
        let ft = StdArc::new(ft);
        let swap = StdArc::new(swap);
        let vaddr = VirtAddr(PHYS_BASE - 0x10_0000);
        spt.mark_zero(vaddr, true);

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let spt = StdArc::clone(&spt);
                let ft = StdArc::clone(&ft);
                let swap = StdArc::clone(&swap);
                std::thread::spawn(move || spt.pull(0, vaddr, false, &ft, &swap, pd, tid, crate::constants::STACK_LIMIT).unwrap())
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), FaultOutcome::Resolved);
        }

        assert_eq!(ft.occupancy(), (1, 4));
        assert_eq!(spt.lookup(vaddr).unwrap().location(), Location::Memory);
    }

    #[test]
    fn eviction_round_trips_through_swap() {
        let (spt, ft, swap, pd, tid) = env();
        // Fill all 4 frames.
        for i in 0..4 {
            let vaddr = VirtAddr(PHYS_BASE - 0x100_0000 + i * PGSIZE);
            spt.alloc(vaddr, true, &ft, &swap, pd, tid).unwrap();
        }
        assert_eq!(ft.occupancy(), (4, 4));

        // A fifth allocation must evict one of the first four.
        let fifth = VirtAddr(PHYS_BASE - 0x200_0000);
        spt.alloc(fifth, true, &ft, &swap, pd, tid).unwrap();
        assert_eq!(ft.occupancy(), (4, 4));
        assert!(swap.occupied() >= 1);
        let _ = SectorId(0);
    }
}
