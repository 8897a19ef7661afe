//! A [`BlockDevice`] backed by a plain file, grounded on the
//! seek-and-read/write sector helpers the xv6-family `mkfs` binaries use
//! to address their disk image directly (`Yuleo1-octox`'s `FsImg::rsect`/
//! `wsect`), reimplemented over `std::fs::File` instead of raw `libc`
//! calls.
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use strata_core::error::{KernelError, Result};
use strata_core::facade::{BlockDevice, DeviceRole, SectorId, SECTOR_SIZE};
use strata_core::sync::SpinLock;

pub struct FileBlockDevice {
    file: SpinLock<File>,
    num_sectors: u32,
    role: DeviceRole,
}

impl FileBlockDevice {
    pub fn new(file: File, num_sectors: u32, role: DeviceRole) -> FileBlockDevice {
        FileBlockDevice {
            file: SpinLock::new(file),
            num_sectors,
            role,
        }
    }
}

impl BlockDevice for FileBlockDevice {
    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn read(&self, sector: SectorId, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let mut f = self.file.lock();
        let result = f
            .seek(SeekFrom::Start(sector.index() as u64 * SECTOR_SIZE as u64))
            .and_then(|_| f.read_exact(buf));
        f.unlock();
        result.map_err(|_| KernelError::Io)
    }

    fn write(&self, sector: SectorId, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        let mut f = self.file.lock();
        let result = f
            .seek(SeekFrom::Start(sector.index() as u64 * SECTOR_SIZE as u64))
            .and_then(|_| f.write_all(buf));
        f.unlock();
        result.map_err(|_| KernelError::Io)
    }

    fn role(&self) -> DeviceRole {
        self.role
    }
}
