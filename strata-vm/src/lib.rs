//! Demand-paged virtual memory: swap store, frame table, supplemental page
//! table, and per-process file/mmap glue (C8-C11).
pub mod constants;
pub mod file;
pub mod frame;
pub mod process;
pub mod spt;
pub mod spte;
pub mod swap;

pub use file::{DirHandle, PageBackedFile};
pub use frame::FrameTable;
pub use process::{MmapRegion, ProcessVm};
pub use spt::{FaultOutcome, SupplementalPageTable};
pub use spte::{Location, Spte, SpteSnapshot};
pub use swap::{SwapSlot, SwapStore};
