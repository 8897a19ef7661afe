//! In-memory fakes for the facade traits in [`crate::facade`].
//!
//! Gated behind the `testing` feature so downstream crates' `dev-dependencies`
//! (and their own tests) can share one set of fakes instead of each crate
//! rolling its own mock block device.
use crate::error::{KernelError, Result};
use crate::facade::{BlockDevice, DeviceRole, FrameId, Mmu, PageDirId, Scheduler, SectorId, ThreadId, VirtAddr, SECTOR_SIZE};
use crate::sync::SpinLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory [`BlockDevice`] backed by a flat `Vec` of sectors.
///
/// Optionally fails every Nth operation to exercise the "no retry" failure
/// model of spec.md §4.3/§7.
pub struct MemBlockDevice {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
    role: DeviceRole,
    fail_every: Option<u32>,
    op_count: AtomicU64,
}

impl MemBlockDevice {
    /// Creates a device with `num_sectors` zeroed sectors.
    pub fn new(num_sectors: u32, role: DeviceRole) -> Self {
        Self {
            sectors: SpinLock::new(vec![[0u8; SECTOR_SIZE]; num_sectors as usize]),
            role,
            fail_every: None,
            op_count: AtomicU64::new(0),
        }
    }

    /// Makes every `n`th read/write fail with [`KernelError::Io`], to
    /// exercise the no-retry failure model.
    pub fn with_fault_injection(mut self, n: u32) -> Self {
        self.fail_every = Some(n);
        self
    }

    fn should_fail(&self) -> bool {
        match self.fail_every {
            Some(n) if n > 0 => self.op_count.fetch_add(1, Ordering::SeqCst) % n as u64 == (n - 1) as u64,
            _ => false,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn num_sectors(&self) -> u32 {
        let g = self.sectors.lock();
        let n = g.len() as u32;
        g.unlock();
        n
    }

    fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        if self.should_fail() {
            return Err(KernelError::Io);
        }
        let g = self.sectors.lock();
        let s = g.get(sector.index()).ok_or(KernelError::InvalidArgument)?;
        buf.copy_from_slice(s);
        g.unlock();
        Ok(())
    }

    fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        if self.should_fail() {
            return Err(KernelError::Io);
        }
        let mut g = self.sectors.lock();
        let s = g.get_mut(sector.index()).ok_or(KernelError::InvalidArgument)?;
        s.copy_from_slice(buf);
        g.unlock();
        Ok(())
    }

    fn role(&self) -> DeviceRole {
        self.role
    }
}

/// An in-memory [`Mmu`] fake: tracks mappings in a hash map per page
/// directory instead of touching real hardware page tables.
#[derive(Default)]
pub struct MockMmu {
    state: SpinLock<HashMap<PageDirId, PageDir>>,
    next_pd: AtomicU64,
}

#[derive(Default)]
struct PageDir {
    mappings: HashMap<VirtAddr, (FrameId, bool)>,
    accessed: HashSet<VirtAddr>,
    dirty: HashSet<VirtAddr>,
}

impl MockMmu {
    /// Creates an empty MMU fake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: marks `uaddr` dirty, as a real write through the
    /// hardware mapping would.
    pub fn mark_dirty(&self, pd: PageDirId, uaddr: VirtAddr) {
        let mut g = self.state.lock();
        g.entry(pd).or_default().dirty.insert(uaddr);
        g.unlock();
    }
}

impl Mmu for MockMmu {
    fn create_pagedir(&self) -> PageDirId {
        let id = PageDirId(self.next_pd.fetch_add(1, Ordering::SeqCst) as usize);
        let mut g = self.state.lock();
        g.insert(id, PageDir::default());
        g.unlock();
        id
    }

    fn destroy_pagedir(&self, pd: PageDirId) {
        let mut g = self.state.lock();
        g.remove(&pd);
        g.unlock();
    }

    fn activate(&self, _pd: PageDirId) {}

    fn install(&self, pd: PageDirId, uaddr: VirtAddr, frame: FrameId, writable: bool) -> bool {
        let mut g = self.state.lock();
        let dir = g.entry(pd).or_default();
        if dir.mappings.contains_key(&uaddr) {
            g.unlock();
            return false;
        }
        dir.mappings.insert(uaddr, (frame, writable));
        g.unlock();
        true
    }

    fn clear(&self, pd: PageDirId, uaddr: VirtAddr) {
        let mut g = self.state.lock();
        if let Some(dir) = g.get_mut(&pd) {
            dir.mappings.remove(&uaddr);
            dir.accessed.remove(&uaddr);
            dir.dirty.remove(&uaddr);
        }
        g.unlock();
    }

    fn is_accessed(&self, pd: PageDirId, uaddr: VirtAddr) -> bool {
        let g = self.state.lock();
        let r = g.get(&pd).is_some_and(|d| d.accessed.contains(&uaddr));
        g.unlock();
        r
    }

    fn set_accessed(&self, pd: PageDirId, uaddr: VirtAddr, accessed: bool) {
        let mut g = self.state.lock();
        if let Some(dir) = g.get_mut(&pd) {
            if accessed {
                dir.accessed.insert(uaddr);
            } else {
                dir.accessed.remove(&uaddr);
            }
        }
        g.unlock();
    }

    fn is_dirty(&self, pd: PageDirId, uaddr: VirtAddr) -> bool {
        let g = self.state.lock();
        let r = g.get(&pd).is_some_and(|d| d.dirty.contains(&uaddr));
        g.unlock();
        r
    }
}

/// A single-thread [`Scheduler`] fake: `yield_now`/`sleep` are no-ops,
/// `block`/`unblock` are not exercised by the single-threaded test harness.
pub struct MockScheduler {
    id: ThreadId,
}

impl MockScheduler {
    /// Creates a fake scheduler reporting `id` as the current thread.
    pub fn new(id: ThreadId) -> Self {
        Self { id }
    }
}

impl Scheduler for MockScheduler {
    fn current(&self) -> ThreadId {
        self.id
    }
    fn yield_now(&self) {}
    fn block(&self) {}
    fn unblock(&self, _tid: ThreadId) {}
    fn sleep(&self, _ticks: u64) {}
}
