//! Page state tracking for demand paging
//!
//! Each address space keeps one entry per page that is not a plain
//! resident mapping: swapped-out anonymous pages, mapped-file pages, and
//! lazily loaded segment pages. The entry is a tagged variant (what backs
//! the page) with an inner presence state (where its bytes currently
//! live); the fault handler and the evictor drive the transitions.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::swap::SwapSlot;
use crate::vfs::DiskFile;

/// Backing-file description for MMF and lazy-segment pages.
#[derive(Clone)]
pub struct FileInfo {
    /// Private handle, reopened so unmapping can close it independently.
    pub file: DiskFile,
    /// Byte offset of this page's data in the file.
    pub offset: u32,
    /// Bytes read from the file; the rest of the page is zeroed.
    pub read_bytes: u32,
    pub zero_bytes: u32,
    pub writable: bool,
    /// Mapping id for mapped files; `None` for lazy segments.
    pub map_id: Option<u64>,
}

/// What backs a tracked page.
pub enum PageKind {
    /// Anonymous memory: stack and other pages that started life resident.
    /// Never unloaded; swap-backed once evicted.
    Anon,
    /// Memory-mapped file page: loaded from and written back to its file.
    Mmf(FileInfo),
    /// Segment page loaded from its file on first fault, swap-backed
    /// afterwards.
    Lazy(FileInfo),
}

/// Where a tracked page's bytes currently are.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Presence {
    /// Not yet materialized; bytes come from the backing file on fault.
    Unloaded,
    /// Resident: the hardware page table maps it to a frame.
    Present,
    /// In the swap device, owning exactly this slot.
    Swapped(SwapSlot),
}

pub struct SptEntry {
    pub kind: PageKind,
    pub presence: Presence,
}

impl SptEntry {
    pub fn anon_swapped(slot: SwapSlot) -> Self {
        SptEntry {
            kind: PageKind::Anon,
            presence: Presence::Swapped(slot),
        }
    }

    pub fn mmf(info: FileInfo) -> Self {
        SptEntry {
            kind: PageKind::Mmf(info),
            presence: Presence::Unloaded,
        }
    }

    pub fn lazy(info: FileInfo) -> Self {
        SptEntry {
            kind: PageKind::Lazy(info),
            presence: Presence::Unloaded,
        }
    }

    pub fn file_info(&self) -> Option<&FileInfo> {
        match &self.kind {
            PageKind::Anon => None,
            PageKind::Mmf(info) | PageKind::Lazy(info) => Some(info),
        }
    }

    pub fn map_id(&self) -> Option<u64> {
        self.file_info().and_then(|i| i.map_id)
    }

    /// Declared writability of the mapping installed on fault-in.
    pub fn writable(&self) -> bool {
        self.file_info().map_or(true, |i| i.writable)
    }

    pub fn is_present(&self) -> bool {
        self.presence == Presence::Present
    }

    /// Fault-in finished: the page is resident.
    pub fn mark_present(&mut self) {
        debug_assert!(
            !self.is_present(),
            "page-in of an already resident page"
        );
        self.presence = Presence::Present;
    }

    /// Evicted to swap. Anonymous-by-now pages only.
    pub fn mark_swapped(&mut self, slot: SwapSlot) {
        debug_assert!(self.is_present(), "swap-out of a non-resident page");
        self.presence = Presence::Swapped(slot);
    }

    /// Evicted back to the file (mapped files only; bytes were flushed or
    /// were clean).
    pub fn mark_unloaded(&mut self) {
        debug_assert!(matches!(self.kind, PageKind::Mmf(_)));
        debug_assert!(self.is_present(), "unload of a non-resident page");
        self.presence = Presence::Unloaded;
    }
}

/// Per-address-space table of tracked pages, keyed by page-aligned user
/// address. Mapped-file sweeps are an iterator filter over map ids rather
/// than a second lookup mode.
#[derive(Default)]
pub struct SuppPageTable {
    entries: BTreeMap<u64, SptEntry>,
    next_map_id: u64,
}

impl SuppPageTable {
    pub fn new() -> Self {
        SuppPageTable {
            entries: BTreeMap::new(),
            next_map_id: 1,
        }
    }

    pub fn get(&self, vaddr: u64) -> Option<&SptEntry> {
        self.entries.get(&vaddr)
    }

    pub fn get_mut(&mut self, vaddr: u64) -> Option<&mut SptEntry> {
        self.entries.get_mut(&vaddr)
    }

    pub fn contains(&self, vaddr: u64) -> bool {
        self.entries.contains_key(&vaddr)
    }

    pub fn insert(&mut self, vaddr: u64, entry: SptEntry) {
        let old = self.entries.insert(vaddr, entry);
        debug_assert!(old.is_none(), "duplicate page tracking at {:#x}", vaddr);
    }

    pub fn remove(&mut self, vaddr: u64) -> Option<SptEntry> {
        self.entries.remove(&vaddr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fresh mapping id, unique within this address space.
    pub fn alloc_map_id(&mut self) -> u64 {
        let id = self.next_map_id;
        self.next_map_id += 1;
        id
    }

    /// Extract every entry belonging to mapping `map_id`.
    pub fn take_by_map_id(&mut self, map_id: u64) -> Vec<(u64, SptEntry)> {
        let pages: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.map_id() == Some(map_id))
            .map(|(&v, _)| v)
            .collect();
        pages
            .into_iter()
            .map(|v| (v, self.entries.remove(&v).unwrap()))
            .collect()
    }

    /// Any outstanding mapping id, if a mapped file is still tracked.
    pub fn any_map_id(&self) -> Option<u64> {
        self.entries.values().find_map(|e| e.map_id())
    }

    /// Number of tracked pages currently in swap.
    pub fn swapped_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e.presence, Presence::Swapped(_)))
            .count()
    }

    /// Remove and return every entry. Used by process teardown.
    pub fn drain_all(&mut self) -> Vec<(u64, SptEntry)> {
        let drained = core::mem::take(&mut self.entries);
        drained.into_iter().collect()
    }
}
