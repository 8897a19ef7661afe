//! Physical-frame pool with clock (second-chance) eviction (spec.md §4.9,
//! C9).
//!
//! The "user pool" is a fixed-size array of page buffers this table owns
//! directly — this crate is hosted, not bare metal, so unlike the teacher
//! kernel's `keos::mm::Page` (a handle onto memory the allocator out of
//! scope per spec.md §1 owns), the frame table here *is* the physical
//! memory allocator for the user pool.
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use strata_core::error::{KernelError, Result};
use strata_core::facade::{FrameId, Mmu, PageDirId, ThreadId, VirtAddr};
use strata_core::sync::SpinLock;

use crate::constants::PGSIZE;
use crate::spte::{Location, Spte};
use crate::swap::SwapStore;

struct FrameEntry {
    pagedir: PageDirId,
    vaddr: VirtAddr,
    owner: ThreadId,
    spte: Arc<Spte>,
}

enum Slot {
    Empty,
    Occupied(FrameEntry),
    /// Reserved mid-eviction: not a valid allocation target, and not
    /// re-selectable by the clock sweep.
    Evicting,
}

/// The frame table: `capacity` physical frames, their storage, and the
/// clock-sweep eviction policy over them.
pub struct FrameTable {
    mmu: Arc<dyn Mmu>,
    storage: Vec<SpinLock<[u8; PGSIZE]>>,
    slots: SpinLock<Vec<Slot>>,
    clock_hand: CachePadded<AtomicUsize>,
}

impl FrameTable {
    pub fn new(mmu: Arc<dyn Mmu>, capacity: usize) -> FrameTable {
        let mut storage = Vec::with_capacity(capacity);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            storage.push(SpinLock::new([0u8; PGSIZE]));
            slots.push(Slot::Empty);
        }
        FrameTable {
            mmu,
            storage,
            slots: SpinLock::new(slots),
            clock_hand: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// How many frames are currently occupied (for diagnostics/tests).
    pub fn occupancy(&self) -> (usize, usize) {
        let g = self.slots.lock();
        let used = g.iter().filter(|s| matches!(s, Slot::Occupied(_))).count();
        let total = g.len();
        g.unlock();
        (used, total)
    }

    /// Obtains a zeroed frame for `spte`, installing the mapping via the
    /// MMU facade. Evicts a victim first if the pool is exhausted
    /// (spec.md §4.9).
    pub fn alloc(&self, spte: Arc<Spte>, pagedir: PageDirId, vaddr: VirtAddr, owner: ThreadId, writable: bool, swap: &SwapStore) -> Result<FrameId> {
        let idx = loop {
            if let Some(idx) = self.try_reserve_empty(pagedir, vaddr, owner, &spte) {
                break idx;
            }
            self.evict(swap)?;
        };
        {
            let mut buf = self.storage[idx].lock();
            buf.fill(0);
            buf.unlock();
        }
        let frame = FrameId(idx);
        if !self.mmu.install(pagedir, vaddr, frame, writable) {
            strata_core::logging::fatal("frame table installed a mapping the MMU already had");
        }
        Ok(frame)
    }

    fn try_reserve_empty(&self, pagedir: PageDirId, vaddr: VirtAddr, owner: ThreadId, spte: &Arc<Spte>) -> Option<usize> {
        let mut g = self.slots.lock();
        for (i, slot) in g.iter_mut().enumerate() {
            if matches!(slot, Slot::Empty) {
                *slot = Slot::Occupied(FrameEntry {
                    pagedir,
                    vaddr,
                    owner,
                    spte: Arc::clone(spte),
                });
                g.unlock();
                return Some(i);
            }
        }
        g.unlock();
        None
    }

    /// Copies `data` (at most [`PGSIZE`] bytes) into `frame`'s backing
    /// storage, zero-filling the remainder.
    pub fn fill(&self, frame: FrameId, data: &[u8]) {
        let mut buf = self.storage[frame.0].lock();
        buf.fill(0);
        buf[..data.len()].copy_from_slice(data);
        buf.unlock();
    }

    pub fn read(&self, frame: FrameId, out: &mut [u8; PGSIZE]) {
        let buf = self.storage[frame.0].lock();
        out.copy_from_slice(&*buf);
        buf.unlock();
    }

    /// Tears down the MMU mapping and releases `frame`.
    pub fn free(&self, frame: FrameId) {
        let mut g = self.slots.lock();
        if let Slot::Occupied(entry) = std::mem::replace(&mut g[frame.0], Slot::Empty) {
            self.mmu.clear(entry.pagedir, entry.vaddr);
        }
        g.unlock();
    }

    /// Chooses a victim by clock (second-chance) sweep over hardware
    /// accessed bits, writes it out (to swap for `Memory`, to its file for
    /// `Mmapped`), and frees the frame. Per spec.md §4.9: the frame-table
    /// lock is released before doing I/O and before acquiring the SPTE's
    /// lock.
    pub fn evict(&self, swap: &SwapStore) -> Result<()> {
        let (idx, entry_pagedir, entry_vaddr, spte) = self.pick_victim()?;

        let mut page = [0u8; PGSIZE];
        self.read(FrameId(idx), &mut page);

        let snap = spte.snapshot();
        match snap.location {
            Location::Memory => {
                let slot = swap.evict(&page)?;
                spte.resolve_to_swap(slot);
                strata_core::logging::debug!("evicted frame {idx} to swap slot {}", slot.0);
            }
            Location::Mmapped => {
                if let Some(file) = &snap.file {
                    file.write_at(snap.file_offset, &page[..snap.read_bytes.min(PGSIZE)])?;
                }
                spte.resolve_to_filesys();
                strata_core::logging::debug!("evicted mmapped frame {idx}, wrote back to file");
            }
            _ => strata_core::logging::fatal("evicted a frame whose SPTE was not Memory or Mmapped"),
        }

        self.mmu.clear(entry_pagedir, entry_vaddr);

        let mut g = self.slots.lock();
        g[idx] = Slot::Empty;
        g.unlock();
        Ok(())
    }

    fn pick_victim(&self) -> Result<(usize, PageDirId, VirtAddr, Arc<Spte>)> {
        let mut g = self.slots.lock();
        let n = g.len();
        if n == 0 {
            g.unlock();
            return Err(KernelError::NoMemory);
        }
        let mut fallback = None;
        for _ in 0..(2 * n) {
            let i = self.clock_hand.fetch_add(1, Ordering::SeqCst) % n;
            let accessed = match &g[i] {
                Slot::Occupied(e) => self.mmu.is_accessed(e.pagedir, e.vaddr),
                _ => continue,
            };
            if fallback.is_none() {
                fallback = Some(i);
            }
            if accessed {
                if let Slot::Occupied(e) = &g[i] {
                    self.mmu.set_accessed(e.pagedir, e.vaddr, false);
                }
                continue;
            }
            let (pagedir, vaddr, spte) = match std::mem::replace(&mut g[i], Slot::Evicting) {
                Slot::Occupied(e) => (e.pagedir, e.vaddr, e.spte),
                _ => unreachable!(),
            };
            g.unlock();
            return Ok((i, pagedir, vaddr, spte));
        }
        let i = match fallback {
            Some(i) => i,
            None => {
                g.unlock();
                return Err(KernelError::NoMemory);
            }
        };
        let (pagedir, vaddr, spte) = match std::mem::replace(&mut g[i], Slot::Evicting) {
            Slot::Occupied(e) => (e.pagedir, e.vaddr, e.spte),
            _ => unreachable!(),
        };
        g.unlock();
        Ok((i, pagedir, vaddr, spte))
    }
}
