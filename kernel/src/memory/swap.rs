//! Swap-slot manager
//!
//! Divides the swap block device into page-sized slots tracked by a free
//! bitmap. Slot claims and releases go through the single swap lock; the
//! sector I/O itself runs outside it, since a claimed slot has exactly one
//! owner. Nothing here survives a reboot: the swap area has no header.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::{PAGE_SIZE, SECTORS_PER_PAGE};
use crate::device::{BlockDevice, Sector, SECTOR_SIZE};

/// Index of a page-sized slot in the swap device.
pub type SwapSlot = u32;

struct SwapInner {
    /// One flag per slot; true = free.
    free: Vec<bool>,
    used: usize,
}

/// Slot allocator over the swap device.
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<SwapInner>,
    swapped_out: AtomicU64,
    swapped_in: AtomicU64,
}

/// Swap statistics
#[derive(Debug, Clone, Copy)]
pub struct SwapStats {
    pub total_slots: usize,
    pub used_slots: usize,
    pub pages_swapped_out: u64,
    pub pages_swapped_in: u64,
}

impl SwapTable {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() as usize / SECTORS_PER_PAGE;
        log::info!("[SWAP] {} slots ({} KB)", slots, slots * PAGE_SIZE / 1024);
        SwapTable {
            device,
            inner: Mutex::new(SwapInner {
                free: vec![true; slots],
                used: 0,
            }),
            swapped_out: AtomicU64::new(0),
            swapped_in: AtomicU64::new(0),
        }
    }

    /// Write one page to a fresh slot. Returns `None` iff the device is
    /// full.
    pub fn swap_out(&self, page: &[u8]) -> Option<SwapSlot> {
        assert_eq!(page.len(), PAGE_SIZE);

        let slot = {
            let mut inner = self.inner.lock();
            let slot = inner.free.iter().position(|&f| f)?;
            inner.free[slot] = false;
            inner.used += 1;
            slot as SwapSlot
        };

        let base = slot as usize * SECTORS_PER_PAGE;
        let mut sec = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            sec.copy_from_slice(&page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            if let Err(e) = self.device.write((base + i) as Sector, &sec) {
                panic!("[SWAP] write of slot {} failed: {:?}", slot, e);
            }
        }
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
        log::trace!("[SWAP] page out -> slot {}", slot);
        Some(slot)
    }

    /// Read `slot` back into `page` and release the slot.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) {
        assert_eq!(page.len(), PAGE_SIZE);

        let base = slot as usize * SECTORS_PER_PAGE;
        let mut sec = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            if let Err(e) = self.device.read((base + i) as Sector, &mut sec) {
                panic!("[SWAP] read of slot {} failed: {:?}", slot, e);
            }
            page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sec);
        }
        self.swapped_in.fetch_add(1, Ordering::Relaxed);
        log::trace!("[SWAP] page in <- slot {}", slot);
        self.swap_free(slot);
    }

    /// Mark `slot` free without reading it (owner discarded the page).
    pub fn swap_free(&self, slot: SwapSlot) {
        let mut inner = self.inner.lock();
        let idx = slot as usize;
        assert!(idx < inner.free.len(), "[SWAP] slot {} out of range", slot);
        assert!(!inner.free[idx], "[SWAP] double free of slot {}", slot);
        inner.free[idx] = true;
        inner.used -= 1;
    }

    pub fn used_slots(&self) -> usize {
        self.inner.lock().used
    }

    pub fn total_slots(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn stats(&self) -> SwapStats {
        let inner = self.inner.lock();
        SwapStats {
            total_slots: inner.free.len(),
            used_slots: inner.used,
            pages_swapped_out: self.swapped_out.load(Ordering::Relaxed),
            pages_swapped_in: self.swapped_in.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    fn table_with_slots(slots: usize) -> SwapTable {
        SwapTable::new(Arc::new(RamDisk::new(
            (slots * SECTORS_PER_PAGE) as Sector,
        )))
    }

    #[test]
    fn test_out_in_round_trip() {
        let swap = table_with_slots(4);
        let page: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 241) as u8).collect();
        let slot = swap.swap_out(&page).unwrap();
        assert_eq!(swap.used_slots(), 1);

        let mut back = vec![0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut back);
        assert_eq!(back, page);
        // swap_in releases the slot
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let swap = table_with_slots(2);
        let page = vec![7u8; PAGE_SIZE];
        let a = swap.swap_out(&page).unwrap();
        let b = swap.swap_out(&page).unwrap();
        assert_ne!(a, b);
        assert!(swap.swap_out(&page).is_none());

        swap.swap_free(a);
        assert_eq!(swap.swap_out(&page), Some(a));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let swap = table_with_slots(2);
        let slot = swap.swap_out(&vec![0u8; PAGE_SIZE]).unwrap();
        swap.swap_free(slot);
        swap.swap_free(slot);
    }
}
