//! RAM-backed block device
//!
//! Reference `BlockDevice` implementation: a flat in-memory sector array.
//! Used as the boot fallback when no disk driver claims a role, and by the
//! subsystem self-tests.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::block::{BlockDevice, BlockError, Sector, SECTOR_SIZE};

/// In-memory disk image. All sectors start zeroed.
pub struct RamDisk {
    sectors: Sector,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    /// Create a disk of `sectors` zero-filled sectors.
    pub fn new(sectors: Sector) -> Self {
        RamDisk {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::InvalidSector);
        }
        let data = self.data.lock();
        let base = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[base..base + SECTOR_SIZE]);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), BlockError> {
        if sector >= self.sectors {
            return Err(BlockError::InvalidSector);
        }
        let mut data = self.data.lock();
        let base = sector as usize * SECTOR_SIZE;
        data[base..base + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> Sector {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_back() {
        let disk = RamDisk::new(16);
        let mut buf = [0xA5u8; SECTOR_SIZE];
        disk.write(3, &buf).unwrap();
        buf.fill(0);
        disk.read(3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_out_of_range() {
        let disk = RamDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(disk.read(4, &mut buf), Err(BlockError::InvalidSector));
        assert_eq!(disk.write(9, &buf), Err(BlockError::InvalidSector));
    }
}
