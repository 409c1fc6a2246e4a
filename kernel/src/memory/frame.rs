//! Physical frame pool and frame table
//!
//! A fixed arena of user frames tracked by a word bitmap, plus the global
//! registry mapping each allocated frame to its owning (address space,
//! user page) pairs. When the pool runs dry, a clock sweep with an
//! accessed-bit second chance picks a victim and its contents are pushed
//! out to swap or back to the owning file before the frame is handed to
//! the new requester.
//!
//! The frame-table lock is the outermost lock in the kernel: eviction
//! acquires the swap lock, the FS lock and cache locks beneath it, and
//! briefly each victim owner's page tracking lock. Nothing that holds one
//! of those may call back into this module.

use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::page::{PageKind, Presence, SptEntry};
use super::swap::SwapTable;
use super::vmspace::VmSpace;
use super::PAGE_SIZE;
use crate::vfs;

bitflags::bitflags! {
    /// Frame allocation flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool. Kernel memory is non-pageable and
        /// not served here.
        const USER = 1 << 0;
        /// Zero the frame before returning it.
        const ZERO = 1 << 1;
    }
}

/// One (space, user page) reference to a frame. A frame may be shared.
pub(crate) struct FrameOwner {
    pub space: Weak<VmSpace>,
    pub space_id: u64,
    pub upage: u64,
}

struct FrameEntry {
    owners: Vec<FrameOwner>,
    /// Pinned frames are skipped by eviction. A frame is pinned from
    /// allocation until its contents and mapping are in place.
    pinned: bool,
}

/// Fixed arena backing the user frame pool. Frame contents are raw bytes
/// accessed through pointers, the way physical memory is.
struct FramePool {
    mem: Vec<UnsafeCell<u8>>,
    frames: usize,
}

// Frame bytes are only touched by threads that own the frame through the
// table (or hold the relevant higher-level lock), mirroring physical RAM.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    fn new(frames: usize) -> Self {
        let mut mem = Vec::new();
        mem.resize_with(frames * PAGE_SIZE, || UnsafeCell::new(0));
        FramePool { mem, frames }
    }

    fn frame_ptr(&self, kpage: u64) -> *mut u8 {
        debug_assert_eq!(kpage % PAGE_SIZE as u64, 0);
        debug_assert!((kpage as usize) < self.frames * PAGE_SIZE);
        self.mem[kpage as usize].get()
    }
}

struct Inner {
    /// Word bitmap over the arena; bit set = allocated.
    bitmap: Vec<u64>,
    /// Hint: word index of the last allocation.
    next_hint: usize,
    /// Registry entry per frame index; `None` while free.
    entries: Vec<Option<FrameEntry>>,
    /// Clock hand for eviction.
    hand: usize,
}

impl Inner {
    fn alloc_index(&mut self, total: usize) -> Option<usize> {
        let words = self.bitmap.len();
        for offset in 0..words {
            let idx = (self.next_hint + offset) % words;
            let word = self.bitmap[idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let frame_index = idx * 64 + bit;
            if frame_index >= total {
                continue;
            }
            self.bitmap[idx] |= 1u64 << bit;
            self.next_hint = idx;
            return Some(frame_index);
        }
        None
    }

    fn free_index(&mut self, frame_index: usize) {
        let word = frame_index / 64;
        let bit = frame_index % 64;
        debug_assert!(self.bitmap[word] & (1u64 << bit) != 0, "double frame free");
        self.bitmap[word] &= !(1u64 << bit);
        self.entries[frame_index] = None;
    }
}

/// Registry of all allocated user frames with clock eviction.
pub struct FrameTable {
    pool: FramePool,
    swap: Arc<SwapTable>,
    inner: Mutex<Inner>,
    used_frames: AtomicU64,
    evictions: AtomicU64,
}

impl FrameTable {
    pub fn new(user_frames: usize, swap: Arc<SwapTable>) -> Self {
        assert!(user_frames > 0);
        log::info!(
            "[FRAME] user pool: {} frames ({} KB)",
            user_frames,
            user_frames * PAGE_SIZE / 1024
        );
        FrameTable {
            pool: FramePool::new(user_frames),
            swap,
            inner: Mutex::new(Inner {
                bitmap: vec![0u64; (user_frames + 63) / 64],
                next_hint: 0,
                entries: (0..user_frames).map(|_| None).collect(),
                hand: 0,
            }),
            used_frames: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Allocate one user frame for (`space`, `upage`). When the pool is
    /// exhausted a victim is evicted and its frame reused; its owner is
    /// replaced with the new requester before the lock drops.
    pub fn alloc(&self, flags: AllocFlags, space: &Arc<VmSpace>, upage: u64) -> u64 {
        assert!(
            flags.contains(AllocFlags::USER),
            "[FRAME] only user-pool pages are pageable"
        );
        let owner = FrameOwner {
            space: Arc::downgrade(space),
            space_id: space.id(),
            upage,
        };

        let kpage = {
            let mut inner = self.inner.lock();
            match inner.alloc_index(self.pool.frames) {
                Some(idx) => {
                    inner.entries[idx] = Some(FrameEntry {
                        owners: vec![owner],
                        pinned: true,
                    });
                    self.used_frames.fetch_add(1, Ordering::Relaxed);
                    (idx * PAGE_SIZE) as u64
                }
                None => {
                    let idx = self.select_victim(&mut inner);
                    let victim = inner.entries[idx].take().expect("victim frame untracked");
                    let kpage = (idx * PAGE_SIZE) as u64;
                    self.page_out(kpage, &victim.owners);
                    inner.entries[idx] = Some(FrameEntry {
                        owners: vec![owner],
                        pinned: true,
                    });
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    kpage
                }
            }
        };

        if flags.contains(AllocFlags::ZERO) {
            unsafe {
                core::ptr::write_bytes(self.pool.frame_ptr(kpage), 0, PAGE_SIZE);
            }
        }
        kpage
    }

    /// Clear the allocation-time pin once the frame's contents and
    /// mapping are in place, making it eligible for eviction.
    pub fn unpin(&self, kpage: u64) {
        let mut inner = self.inner.lock();
        let idx = kpage as usize / PAGE_SIZE;
        if let Some(entry) = inner.entries[idx].as_mut() {
            entry.pinned = false;
        }
    }

    /// Release a frame outright (owner tracking included).
    pub fn free(&self, kpage: u64) {
        let mut inner = self.inner.lock();
        let idx = kpage as usize / PAGE_SIZE;
        assert!(inner.entries[idx].is_some(), "[FRAME] free of untracked frame");
        inner.free_index(idx);
        self.used_frames.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drop one owner reference; the frame is freed once unowned.
    pub fn remove_owner(&self, kpage: u64, space_id: u64, upage: u64) {
        let mut inner = self.inner.lock();
        let idx = kpage as usize / PAGE_SIZE;
        if let Some(entry) = inner.entries[idx].as_mut() {
            entry
                .owners
                .retain(|o| !(o.space_id == space_id && o.upage == upage));
            if entry.owners.is_empty() {
                inner.free_index(idx);
                self.used_frames.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every owner reference held by an exiting address space,
    /// freeing frames that become unowned. This is what reclaims resident
    /// pages that never acquired tracking entries (fresh stack pages).
    pub fn release_space(&self, space_id: u64) {
        let mut inner = self.inner.lock();
        for idx in 0..inner.entries.len() {
            if let Some(entry) = inner.entries[idx].as_mut() {
                entry.owners.retain(|o| o.space_id != space_id);
                if entry.owners.is_empty() {
                    inner.free_index(idx);
                    self.used_frames.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Return (total, used) frame counts.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.pool.frames as u64,
            self.used_frames.load(Ordering::Relaxed),
        )
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub(crate) fn swap(&self) -> &Arc<SwapTable> {
        &self.swap
    }

    /// Raw bytes of an allocated frame.
    ///
    /// # Safety
    /// The caller must own `kpage` through this table (or be the evictor
    /// holding the table lock) so no other thread mutates the frame.
    pub(crate) unsafe fn frame_slice(&self, kpage: u64) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.pool.frame_ptr(kpage), PAGE_SIZE)
    }

    /// Clock sweep with accessed-bit second chance across every owner.
    /// A frame whose owners all show accessed=false is the victim; any
    /// accessed owner costs the frame its turn and clears the bit for all
    /// owners. Two full passes must suffice: pass one clears every
    /// accessed bit it sees, so pass two finds a victim.
    fn select_victim(&self, inner: &mut Inner) -> usize {
        let n = inner.entries.len();
        for _pass in 0..3 {
            for _ in 0..n {
                let i = inner.hand;
                inner.hand = (inner.hand + 1) % n;
                let Some(entry) = inner.entries[i].as_ref() else {
                    continue;
                };
                if entry.pinned {
                    continue;
                }

                let mut live = 0;
                let mut accessed = false;
                for o in &entry.owners {
                    if let Some(space) = o.space.upgrade() {
                        live += 1;
                        if space.pt_is_accessed(o.upage) {
                            accessed = true;
                        }
                    }
                }
                if live == 0 {
                    // Every owner died without teardown; reclaim as-is.
                    return i;
                }
                if accessed {
                    for o in &entry.owners {
                        if let Some(space) = o.space.upgrade() {
                            space.pt_set_accessed(o.upage, false);
                        }
                    }
                } else {
                    return i;
                }
            }
        }
        panic!("[FRAME] eviction made no progress");
    }

    /// Push a victim frame's contents out before it is reused. Must run
    /// with the frame-table lock held, before the frame changes hands.
    fn page_out(&self, kpage: u64, owners: &[FrameOwner]) {
        enum Disposition {
            /// Untracked resident page: swap it and create anonymous
            /// swapped entries for every owner.
            AnonFresh,
            /// Tracked anonymous or lazy page: swap it.
            SwapOut,
            /// Mapped-file page: flush to the file if dirty, then unload.
            Mmf {
                file: crate::vfs::DiskFile,
                offset: u32,
                read_bytes: u32,
            },
        }

        let Some((first, first_space)) = owners
            .iter()
            .find_map(|o| o.space.upgrade().map(|s| (o, s)))
        else {
            return; // all owners gone; the frame is simply reclaimed
        };

        let disposition = {
            let spt = first_space.spt().lock();
            match spt.get(first.upage) {
                None => Disposition::AnonFresh,
                Some(e) => match (&e.kind, e.presence) {
                    (_, Presence::Swapped(_)) => {
                        panic!("[FRAME] evicting a page marked swapped")
                    }
                    (_, Presence::Unloaded) => {
                        panic!("[FRAME] evicting a page marked unloaded")
                    }
                    (PageKind::Mmf(info), Presence::Present) => Disposition::Mmf {
                        file: info.file.clone(),
                        offset: info.offset,
                        read_bytes: info.read_bytes,
                    },
                    (PageKind::Anon | PageKind::Lazy(_), Presence::Present) => {
                        Disposition::SwapOut
                    }
                },
            }
        };

        // Safety: we hold the frame-table lock and the frame is still
        // registered to its old owners; nothing else mutates it.
        let frame = unsafe { self.frame_slice(kpage) };

        match disposition {
            Disposition::AnonFresh => {
                let slot = self
                    .swap
                    .swap_out(frame)
                    .unwrap_or_else(|| panic!("[FRAME] swap device full"));
                for o in owners {
                    if let Some(space) = o.space.upgrade() {
                        space.spt().lock().insert(o.upage, SptEntry::anon_swapped(slot));
                        space.pt_unmap(o.upage);
                    }
                }
            }
            Disposition::SwapOut => {
                let slot = self
                    .swap
                    .swap_out(frame)
                    .unwrap_or_else(|| panic!("[FRAME] swap device full"));
                for o in owners {
                    if let Some(space) = o.space.upgrade() {
                        if let Some(e) = space.spt().lock().get_mut(o.upage) {
                            e.mark_swapped(slot);
                        }
                        space.pt_unmap(o.upage);
                    }
                }
            }
            Disposition::Mmf { file, offset, read_bytes } => {
                let dirty = owners.iter().any(|o| {
                    o.space
                        .upgrade()
                        .map_or(false, |s| s.pt_is_dirty(o.upage))
                });
                if dirty {
                    let _fs = vfs::fs_lock();
                    file.write_at(offset, &frame[..read_bytes as usize]);
                }
                for o in owners {
                    if let Some(space) = o.space.upgrade() {
                        if let Some(e) = space.spt().lock().get_mut(o.upage) {
                            e.mark_unloaded();
                        }
                        space.pt_unmap(o.upage);
                    }
                }
            }
        }
    }
}
