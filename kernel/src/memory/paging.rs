//! Hardware page-table contract
//!
//! The MMU-facing page table is arch code outside this crate; the VM core
//! drives it through `PageMapper`. `SoftPageTable` is the reference
//! implementation: a plain map with the same observable behavior
//! (including accessed/dirty bookkeeping), used when no MMU backend is
//! wired in and by the subsystem tests.

use alloc::collections::BTreeMap;

/// Per-address-space page-table operations, `upage` → `kpage` at page
/// granularity. Implementations are driven with the owning space's
/// page-table lock held, so they need no locking of their own.
pub trait PageMapper: Send {
    /// Map `upage` to the frame `kpage`. Returns false if the mapping
    /// could not be created (e.g. no memory for an intermediate table).
    fn map(&mut self, upage: u64, kpage: u64, writable: bool) -> bool;

    /// Remove the mapping for `upage`, if any.
    fn unmap(&mut self, upage: u64);

    /// Frame mapped at `upage`, if present.
    fn lookup(&self, upage: u64) -> Option<u64>;

    fn is_present(&self, upage: u64) -> bool {
        self.lookup(upage).is_some()
    }

    fn is_writable(&self, upage: u64) -> bool;

    fn is_dirty(&self, upage: u64) -> bool;

    fn set_dirty(&mut self, upage: u64, dirty: bool);

    fn is_accessed(&self, upage: u64) -> bool;

    fn set_accessed(&mut self, upage: u64, accessed: bool);
}

struct SoftEntry {
    kpage: u64,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Software page table: the reference `PageMapper`.
#[derive(Default)]
pub struct SoftPageTable {
    entries: BTreeMap<u64, SoftEntry>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        SoftPageTable::default()
    }
}

impl PageMapper for SoftPageTable {
    fn map(&mut self, upage: u64, kpage: u64, writable: bool) -> bool {
        self.entries.insert(
            upage,
            SoftEntry {
                kpage,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn unmap(&mut self, upage: u64) {
        self.entries.remove(&upage);
    }

    fn lookup(&self, upage: u64) -> Option<u64> {
        self.entries.get(&upage).map(|e| e.kpage)
    }

    fn is_writable(&self, upage: u64) -> bool {
        self.entries.get(&upage).map_or(false, |e| e.writable)
    }

    fn is_dirty(&self, upage: u64) -> bool {
        self.entries.get(&upage).map_or(false, |e| e.dirty)
    }

    fn set_dirty(&mut self, upage: u64, dirty: bool) {
        if let Some(e) = self.entries.get_mut(&upage) {
            e.dirty = dirty;
        }
    }

    fn is_accessed(&self, upage: u64) -> bool {
        self.entries.get(&upage).map_or(false, |e| e.accessed)
    }

    fn set_accessed(&mut self, upage: u64, accessed: bool) {
        if let Some(e) = self.entries.get_mut(&upage) {
            e.accessed = accessed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_lookup_unmap() {
        let mut pt = SoftPageTable::new();
        assert!(pt.map(0x1000, 0x8000, true));
        assert_eq!(pt.lookup(0x1000), Some(0x8000));
        assert!(pt.is_present(0x1000));
        assert!(pt.is_writable(0x1000));
        pt.unmap(0x1000);
        assert!(!pt.is_present(0x1000));
    }

    #[test]
    fn test_accessed_dirty_bits() {
        let mut pt = SoftPageTable::new();
        pt.map(0x2000, 0x9000, false);
        assert!(!pt.is_accessed(0x2000));
        pt.set_accessed(0x2000, true);
        assert!(pt.is_accessed(0x2000));
        pt.set_accessed(0x2000, false);
        assert!(!pt.is_accessed(0x2000));
        pt.set_dirty(0x2000, true);
        assert!(pt.is_dirty(0x2000));
    }
}
