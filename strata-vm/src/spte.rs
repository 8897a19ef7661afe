//! Supplemental page-table entry (spec.md §3/§4.10, part of C10).
//!
//! Grounded on the `VmAreaStruct`/loader-kind doc comments in
//! `keos-project3/src/lazy_pager.rs`, reimplemented as a tagged-variant
//! struct per spec.md §9 ("SPTE `location` is a tagged variant governing
//! which other fields are meaningful") rather than the teacher's
//! trait-object `MmLoader` hierarchy.
use std::sync::Arc;

use strata_core::facade::{FrameId, VirtAddr};
use strata_core::sync::{SpinLock, SpinLockGuard};

use crate::file::PageBackedFile;
use crate::swap::SwapSlot;

/// Which backing store currently holds a page's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Not yet materialized; reads as all-zero.
    Zero,
    /// Evicted to a swap slot.
    Swap,
    /// Resident in a physical frame, anonymous (or formerly `Exec`).
    Memory,
    /// A loadable ELF segment, not yet faulted in.
    Exec,
    /// An mmap'd file page, not yet faulted in.
    Filesys,
    /// Resident in a physical frame, backed by a file (future eviction
    /// writes back instead of going to swap).
    Mmapped,
    /// Unresolvable; the owning fault handler kills the process.
    Error,
}

/// A read-only snapshot of an [`Spte`]'s fields, taken under its lock.
#[derive(Clone)]
pub struct SpteSnapshot {
    pub location: Location,
    pub frame: Option<FrameId>,
    pub swap_index: Option<SwapSlot>,
    pub file: Option<Arc<dyn PageBackedFile>>,
    pub file_offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

struct SpteState {
    location: Location,
    frame: Option<FrameId>,
    swap_index: Option<SwapSlot>,
    file: Option<Arc<dyn PageBackedFile>>,
    file_offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
}

impl SpteState {
    fn snapshot(&self) -> SpteSnapshot {
        SpteSnapshot {
            location: self.location,
            frame: self.frame,
            swap_index: self.swap_index,
            file: self.file.clone(),
            file_offset: self.file_offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
            writable: self.writable,
        }
    }
}

/// One page-aligned user virtual address's metadata. Per-process; fault
/// resolution on one SPTE is serialized by its own lock (spec.md §5).
pub struct Spte {
    vaddr: VirtAddr,
    state: SpinLock<SpteState>,
}

impl Spte {
    pub fn zero(vaddr: VirtAddr, writable: bool) -> Arc<Spte> {
        Arc::new(Spte {
            vaddr,
            state: SpinLock::new(SpteState {
                location: Location::Zero,
                frame: None,
                swap_index: None,
                file: None,
                file_offset: 0,
                read_bytes: 0,
                zero_bytes: crate::constants::PGSIZE,
                writable,
            }),
        })
    }

    pub fn memory(vaddr: VirtAddr, frame: FrameId, writable: bool) -> Arc<Spte> {
        Arc::new(Spte {
            vaddr,
            state: SpinLock::new(SpteState {
                location: Location::Memory,
                frame: Some(frame),
                swap_index: None,
                file: None,
                file_offset: 0,
                read_bytes: 0,
                zero_bytes: 0,
                writable,
            }),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn file_backed(
        vaddr: VirtAddr,
        file: Arc<dyn PageBackedFile>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        location: Location,
    ) -> Arc<Spte> {
        debug_assert!(matches!(location, Location::Exec | Location::Filesys));
        Arc::new(Spte {
            vaddr,
            state: SpinLock::new(SpteState {
                location,
                frame: None,
                swap_index: None,
                file: Some(file),
                file_offset: offset,
                read_bytes,
                zero_bytes,
                writable,
            }),
        })
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    pub fn location(&self) -> Location {
        let g = self.state.lock();
        let l = g.location;
        g.unlock();
        l
    }

    pub fn writable(&self) -> bool {
        let g = self.state.lock();
        let w = g.writable;
        g.unlock();
        w
    }

    pub fn frame(&self) -> Option<FrameId> {
        let g = self.state.lock();
        let f = g.frame;
        g.unlock();
        f
    }

    /// Takes a consistent snapshot of every field under the SPTE lock.
    pub fn snapshot(&self) -> SpteSnapshot {
        let g = self.state.lock();
        let s = g.snapshot();
        g.unlock();
        s
    }

    /// Transitions this SPTE to `Memory`, owning `frame`.
    pub fn resolve_to_memory(&self, frame: FrameId) {
        let mut g = self.state.lock();
        g.location = Location::Memory;
        g.frame = Some(frame);
        g.swap_index = None;
        g.unlock();
    }

    /// Transitions this SPTE to `Mmapped`, owning `frame` (future eviction
    /// writes back to `file` instead of swap).
    pub fn resolve_to_mmapped(&self, frame: FrameId) {
        let mut g = self.state.lock();
        g.location = Location::Mmapped;
        g.frame = Some(frame);
        g.unlock();
    }

    /// Transitions this SPTE to `Swap`, recording which slot now holds it
    /// and dropping the frame it used to own (the caller has already
    /// freed the frame itself).
    pub fn resolve_to_swap(&self, slot: SwapSlot) {
        let mut g = self.state.lock();
        g.location = Location::Swap;
        g.frame = None;
        g.swap_index = Some(slot);
        g.unlock();
    }

    /// Transitions this SPTE to `Filesys` (evicted `Mmapped` page, written
    /// back), dropping the frame it used to own.
    pub fn resolve_to_filesys(&self) {
        let mut g = self.state.lock();
        g.location = Location::Filesys;
        g.frame = None;
        g.unlock();
    }

    /// Locks this SPTE for a multi-step lookup-check-resolve sequence
    /// (spec.md §5: "within one SPTE, fault resolution is serialized by
    /// the SPTE lock"). Unlike [`Spte::snapshot`]/`resolve_to_*`, which
    /// each take and release the lock independently, the guard this
    /// returns keeps the lock held from the initial snapshot through the
    /// terminal resolve call, so a second thread faulting the same SPTE
    /// blocks until the first has fully resolved it rather than racing it.
    pub fn lock(&self) -> SpteGuard<'_> {
        SpteGuard { guard: self.state.lock() }
    }
}

/// A held lock on one [`Spte`], spanning a full fault-resolution sequence.
/// Every terminal method consumes the guard and releases the lock; a
/// guard dropped without calling one panics, per [`SpinLock`]'s discipline.
pub struct SpteGuard<'a> {
    guard: SpinLockGuard<'a, SpteState>,
}

impl<'a> SpteGuard<'a> {
    /// A snapshot of the fields as they stood at lock time (and still
    /// stand, since nothing else can touch this SPTE while the guard is
    /// held).
    pub fn snapshot(&self) -> SpteSnapshot {
        self.guard.snapshot()
    }

    /// Releases the lock without changing the SPTE's state.
    pub fn release(self) {
        self.guard.unlock();
    }

    /// Transitions this SPTE to `Memory`, owning `frame`, and releases
    /// the lock.
    pub fn resolve_to_memory(mut self, frame: FrameId) {
        self.guard.location = Location::Memory;
        self.guard.frame = Some(frame);
        self.guard.swap_index = None;
        self.guard.unlock();
    }

    /// Transitions this SPTE to `Mmapped`, owning `frame`, and releases
    /// the lock.
    pub fn resolve_to_mmapped(mut self, frame: FrameId) {
        self.guard.location = Location::Mmapped;
        self.guard.frame = Some(frame);
        self.guard.unlock();
    }
}
