//! Extent files
//!
//! Minimal file object for the VM core: a contiguous run of sectors plus a
//! byte length. All I/O goes through the buffer cache, so a memory-mapped
//! page flushing to its file lands in the cache like any other write.
//! Multi-sector reads hint the next sector to the read-ahead daemon the
//! way the file layer above feeds it.

use alloc::sync::Arc;

use super::block_cache::BufferCache;
use crate::device::{Sector, SECTOR_SIZE};

/// A contiguous-extent file. Cloning (`reopen`) yields an independent
/// handle onto the same sectors, closed by dropping it.
#[derive(Clone)]
pub struct DiskFile {
    cache: Arc<BufferCache>,
    start: Sector,
    len: u32,
}

impl DiskFile {
    /// A file of `len` bytes stored in consecutive sectors from `start`.
    pub fn new(cache: Arc<BufferCache>, start: Sector, len: u32) -> Self {
        DiskFile { cache, start, len }
    }

    /// File length in bytes.
    pub fn length(&self) -> u32 {
        self.len
    }

    /// Independent handle onto the same file, as `file_reopen` gives the
    /// mmap path a reference it can close on its own.
    pub fn reopen(&self) -> DiskFile {
        self.clone()
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read (short only at end of file).
    pub fn read_at(&self, offset: u32, buf: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = buf.len().min((self.len - offset) as usize);
        if n == 0 {
            return 0;
        }
        let mut done = 0usize;
        while done < n {
            let pos = offset as usize + done;
            let sector = self.start + (pos / SECTOR_SIZE) as Sector;
            let sec_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sec_off).min(n - done);
            self.cache.read(sector, &mut buf[done..done + chunk], sec_off, chunk);
            done += chunk;
        }

        // Hint the sector after the read to the read-ahead daemon.
        let last = self.start + ((offset as usize + n - 1) / SECTOR_SIZE) as Sector;
        let next = last + 1;
        if ((next - self.start) as usize * SECTOR_SIZE) < self.len as usize {
            self.cache.request_read_ahead(next);
        }
        n
    }

    /// Write up to `buf.len()` bytes at byte `offset`. The file does not
    /// grow; returns the number of bytes written (short at end of file).
    pub fn write_at(&self, offset: u32, buf: &[u8]) -> usize {
        if offset >= self.len {
            return 0;
        }
        let n = buf.len().min((self.len - offset) as usize);
        let mut done = 0usize;
        while done < n {
            let pos = offset as usize + done;
            let sector = self.start + (pos / SECTOR_SIZE) as Sector;
            let sec_off = pos % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sec_off).min(n - done);
            self.cache.write(sector, &buf[done..done + chunk], sec_off, chunk);
            done += chunk;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    fn file_of(len: u32) -> DiskFile {
        let disk = Arc::new(RamDisk::new(1024));
        let cache = Arc::new(BufferCache::new(disk));
        DiskFile::new(cache, 16, len)
    }

    #[test]
    fn test_cross_sector_round_trip() {
        let f = file_of(3000);
        let data: alloc::vec::Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(f.write_at(300, &data), 1500);
        let mut out = alloc::vec![0u8; 1500];
        assert_eq!(f.read_at(300, &mut out), 1500);
        assert_eq!(out, data);
    }

    #[test]
    fn test_clamps_at_eof() {
        let f = file_of(1000);
        let mut out = [0u8; 64];
        assert_eq!(f.read_at(990, &mut out), 10);
        assert_eq!(f.read_at(1000, &mut out), 0);
        assert_eq!(f.write_at(990, &[1u8; 64]), 10);
        assert_eq!(f.write_at(2000, &[1u8; 8]), 0);
    }

    #[test]
    fn test_reopen_shares_contents() {
        let f = file_of(512);
        f.write_at(0, &[9u8; 512]);
        let g = f.reopen();
        let mut out = [0u8; 512];
        assert_eq!(g.read_at(0, &mut out), 512);
        assert_eq!(out, [9u8; 512]);
    }
}
