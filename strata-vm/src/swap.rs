//! Fixed-slot page-sized anonymous backing store (spec.md §4.8, C8).
use std::sync::Arc;

use strata_core::error::{KernelError, Result};
use strata_core::facade::{BlockDevice, SectorId};
use strata_core::sync::SpinLock;

use crate::constants::{PGSIZE, SECTORS_PER_PAGE};

/// A slot index on the swap device. [`SwapSlot::NONE`] marks "no slot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

impl SwapSlot {
    pub const NONE: SwapSlot = SwapSlot(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// The swap store: a bitmap of page-sized slots over a dedicated
/// [`BlockDevice`] (`role() == Swap`).
///
/// Allocation/deallocation is serialized by a single lock; the actual I/O
/// happens outside it — slots are reserved first, then written or read
/// (spec.md §4.8).
pub struct SwapStore {
    device: Arc<dyn BlockDevice>,
    num_slots: u32,
    bits: SpinLock<Vec<u8>>,
}

impl SwapStore {
    pub fn new(device: Arc<dyn BlockDevice>) -> SwapStore {
        let num_slots = device.num_sectors() / SECTORS_PER_PAGE as u32;
        let bytes = (num_slots as usize).div_ceil(8).max(1);
        SwapStore {
            device,
            num_slots,
            bits: SpinLock::new(vec![0u8; bytes]),
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// How many slots are currently occupied, for the swap-bitmap
    /// population invariant in spec.md §8.
    pub fn occupied(&self) -> u32 {
        let g = self.bits.lock();
        let n = (0..self.num_slots).filter(|&i| get_bit(&g, i)).count() as u32;
        g.unlock();
        n
    }

    pub fn is_occupied(&self, slot: SwapSlot) -> bool {
        let g = self.bits.lock();
        let v = get_bit(&g, slot.0);
        g.unlock();
        v
    }

    /// Reserves a free slot and writes `page` into it.
    pub fn evict(&self, page: &[u8; PGSIZE]) -> Result<SwapSlot> {
        let slot = self.reserve()?;
        if let Err(e) = self.write_slot(slot, page) {
            self.free(slot);
            return Err(e);
        }
        Ok(slot)
    }

    /// Reads `slot`'s contents into `out`. Does not free the slot; the
    /// caller frees it explicitly once the page is safely resident again
    /// (spec.md §4.10's `SWAP` fault path: copy in, then free).
    pub fn reclaim(&self, slot: SwapSlot, out: &mut [u8; PGSIZE]) -> Result<()> {
        self.read_slot(slot, out)
    }

    /// Releases `slot` back to the free pool.
    pub fn free(&self, slot: SwapSlot) {
        let mut g = self.bits.lock();
        set_bit(&mut g, slot.0, false);
        g.unlock();
    }

    fn reserve(&self) -> Result<SwapSlot> {
        let mut g = self.bits.lock();
        for i in 0..self.num_slots {
            if !get_bit(&g, i) {
                set_bit(&mut g, i, true);
                g.unlock();
                return Ok(SwapSlot(i));
            }
        }
        g.unlock();
        Err(KernelError::NoSpace)
    }

    fn write_slot(&self, slot: SwapSlot, page: &[u8; PGSIZE]) -> Result<()> {
        for i in 0..SECTORS_PER_PAGE {
            let sector = SectorId(slot.0 * SECTORS_PER_PAGE as u32 + i as u32);
            let mut buf = [0u8; strata_core::facade::SECTOR_SIZE];
            let len = buf.len();
            buf.copy_from_slice(&page[i * len..(i + 1) * len]);
            self.device.write(sector, &buf)?;
        }
        Ok(())
    }

    fn read_slot(&self, slot: SwapSlot, out: &mut [u8; PGSIZE]) -> Result<()> {
        for i in 0..SECTORS_PER_PAGE {
            let sector = SectorId(slot.0 * SECTORS_PER_PAGE as u32 + i as u32);
            let mut buf = [0u8; strata_core::facade::SECTOR_SIZE];
            self.device.read(sector, &mut buf)?;
            out[i * buf.len()..(i + 1) * buf.len()].copy_from_slice(&buf);
        }
        Ok(())
    }
}

fn get_bit(bits: &[u8], i: u32) -> bool {
    (bits[(i / 8) as usize] >> (i % 8)) & 1 != 0
}

fn set_bit(bits: &mut [u8], i: u32, v: bool) {
    let byte = &mut bits[(i / 8) as usize];
    if v {
        *byte |= 1 << (i % 8);
    } else {
        *byte &= !(1 << (i % 8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::facade::DeviceRole;
    use strata_core::testing::MemBlockDevice;

    fn store(slots: u32) -> SwapStore {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(slots * SECTORS_PER_PAGE as u32, DeviceRole::Swap));
        SwapStore::new(dev)
    }

    #[test]
    fn evict_reclaim_roundtrip() {
        let s = store(4);
        let page = [0x42u8; PGSIZE];
        let slot = s.evict(&page).unwrap();
        assert!(s.is_occupied(slot));

        let mut out = [0u8; PGSIZE];
        s.reclaim(slot, &mut out).unwrap();
        assert_eq!(out, page);

        s.free(slot);
        assert!(!s.is_occupied(slot));
    }

    #[test]
    fn exhaustion_returns_no_space() {
        let s = store(1);
        s.evict(&[0u8; PGSIZE]).unwrap();
        assert_eq!(s.evict(&[1u8; PGSIZE]).unwrap_err(), KernelError::NoSpace);
    }

    #[test]
    fn occupied_count_matches_bitmap_population() {
        let s = store(4);
        let a = s.evict(&[1u8; PGSIZE]).unwrap();
        let _b = s.evict(&[2u8; PGSIZE]).unwrap();
        assert_eq!(s.occupied(), 2);
        s.free(a);
        assert_eq!(s.occupied(), 1);
    }
}
