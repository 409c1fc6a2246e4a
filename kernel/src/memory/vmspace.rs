//! Address spaces
//!
//! One `VmSpace` per user process: its hardware page table (behind the
//! `PageMapper` contract), its tracked-page table, and the operations the
//! fault path and the mmap/munmap syscalls need. The user-memory copy
//! helpers at the bottom are the uaccess surface the syscall layer drives;
//! they resolve pages through the mapper and fault them in exactly as the
//! MMU would.
//!
//! Lock rules for this module: the tracked-page lock and the mapper lock
//! are the innermost locks in the kernel, so nothing here may call into
//! the frame table (or the FS) while holding either. Every method below
//! snapshots what it needs, drops the lock, then acts.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::frame::{AllocFlags, FrameTable};
use super::page::{FileInfo, Presence, SptEntry, SuppPageTable};
use super::paging::PageMapper;
use super::swap::SwapSlot;
use super::{is_page_aligned, is_user_vaddr, page_round_down, MAX_STACK, PAGE_SIZE, PHYS_BASE};
use crate::vfs::{self, DiskFile};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// A user address space.
pub struct VmSpace {
    id: u64,
    frames: Arc<FrameTable>,
    mapper: Mutex<Box<dyn PageMapper>>,
    spt: Mutex<SuppPageTable>,
    /// Latest user stack pointer, consulted by the uaccess fault path.
    user_esp: AtomicU64,
}

impl VmSpace {
    pub fn new(frames: Arc<FrameTable>, mapper: Box<dyn PageMapper>) -> Arc<Self> {
        Arc::new(VmSpace {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            frames,
            mapper: Mutex::new(mapper),
            spt: Mutex::new(SuppPageTable::new()),
            user_esp: AtomicU64::new(PHYS_BASE),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record the user stack pointer at kernel entry.
    pub fn set_user_esp(&self, esp: u64) {
        self.user_esp.store(esp, Ordering::Relaxed);
    }

    pub(crate) fn spt(&self) -> &Mutex<SuppPageTable> {
        &self.spt
    }

    pub(crate) fn pt_is_accessed(&self, upage: u64) -> bool {
        self.mapper.lock().is_accessed(upage)
    }

    pub(crate) fn pt_set_accessed(&self, upage: u64, accessed: bool) {
        self.mapper.lock().set_accessed(upage, accessed);
    }

    pub(crate) fn pt_is_dirty(&self, upage: u64) -> bool {
        self.mapper.lock().is_dirty(upage)
    }

    pub(crate) fn pt_unmap(&self, upage: u64) {
        self.mapper.lock().unmap(upage);
    }

    /// Number of tracked pages (diagnostics).
    pub fn tracked_pages(&self) -> usize {
        self.spt.lock().len()
    }

    /// Number of this space's pages currently in swap (diagnostics).
    pub fn swapped_pages(&self) -> usize {
        self.spt.lock().swapped_count()
    }

    // ------------------------------------------------------------------
    // Fault handling
    // ------------------------------------------------------------------

    /// Resolve a fault at `vaddr`. Returns false when the fault is not
    /// resolvable and the process must be terminated.
    pub fn handle_page_fault(self: &Arc<Self>, vaddr: u64, user_esp: u64) -> bool {
        if vaddr == 0 || !is_user_vaddr(vaddr) {
            return false;
        }
        let page = page_round_down(vaddr);

        let tracked = self.spt.lock().contains(page);
        if tracked {
            return self.page_in(page);
        }

        // Untracked fault: stack growth if the access is at or above
        // esp − 32 and the page stays within the stack limit.
        let is_stack_growth =
            vaddr >= user_esp.saturating_sub(32) && PHYS_BASE - vaddr <= MAX_STACK;
        if is_stack_growth {
            self.grow_stack(page)
        } else {
            false
        }
    }

    /// Materialize a tracked page: swap-in for swapped pages, file read
    /// plus zero tail for unloaded ones.
    fn page_in(self: &Arc<Self>, page: u64) -> bool {
        enum Load {
            Swap { slot: SwapSlot, writable: bool },
            File {
                file: DiskFile,
                offset: u32,
                read_bytes: u32,
                writable: bool,
            },
        }

        let load = {
            let spt = self.spt.lock();
            let Some(entry) = spt.get(page) else {
                return false;
            };
            match entry.presence {
                Presence::Present => panic!("[VM] fault on a resident page {:#x}", page),
                Presence::Swapped(slot) => Load::Swap {
                    slot,
                    writable: entry.writable(),
                },
                Presence::Unloaded => {
                    let info = entry.file_info().expect("unloaded page without a file");
                    Load::File {
                        file: info.file.clone(),
                        offset: info.offset,
                        read_bytes: info.read_bytes,
                        writable: info.writable,
                    }
                }
            }
        };

        let kpage = self.frames.alloc(AllocFlags::USER, self, page);
        match load {
            Load::Swap { slot, writable } => {
                if !self.mapper.lock().map(page, kpage, writable) {
                    self.frames.free(kpage);
                    return false;
                }
                // Safety: the frame is pinned and owned by this space.
                let frame = unsafe { self.frames.frame_slice(kpage) };
                self.frames.swap().swap_in(slot, frame);
            }
            Load::File {
                file,
                offset,
                read_bytes,
                writable,
            } => {
                // Safety: the frame is pinned and owned by this space.
                let frame = unsafe { self.frames.frame_slice(kpage) };
                if read_bytes > 0 {
                    let _fs = vfs::fs_lock();
                    let n = file.read_at(offset, &mut frame[..read_bytes as usize]);
                    debug_assert_eq!(n, read_bytes as usize);
                }
                frame[read_bytes as usize..].fill(0);
                if !self.mapper.lock().map(page, kpage, writable) {
                    self.frames.free(kpage);
                    return false;
                }
            }
        }

        self.spt
            .lock()
            .get_mut(page)
            .expect("tracked page vanished during fault")
            .mark_present();
        self.frames.unpin(kpage);
        true
    }

    /// Install a fresh zeroed, writable stack page. No tracking entry is
    /// created; the page acquires one if it is ever evicted.
    fn grow_stack(self: &Arc<Self>, page: u64) -> bool {
        let kpage = self
            .frames
            .alloc(AllocFlags::USER | AllocFlags::ZERO, self, page);
        if !self.mapper.lock().map(page, kpage, true) {
            self.frames.free(kpage);
            return false;
        }
        self.frames.unpin(kpage);
        log::trace!("[VM] stack grown to {:#x}", page);
        true
    }

    // ------------------------------------------------------------------
    // Lazy segments and mapped files
    // ------------------------------------------------------------------

    /// Register one page of a demand-loaded segment: the first fault reads
    /// `read_bytes` from the file and zeroes the rest; eviction then backs
    /// the page with swap.
    pub fn register_segment(
        &self,
        file: &DiskFile,
        offset: u32,
        upage: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<(), &'static str> {
        if upage == 0 || !is_page_aligned(upage) {
            return Err("segment address not page-aligned");
        }
        assert_eq!(read_bytes + zero_bytes, PAGE_SIZE as u32);

        let mut spt = self.spt.lock();
        if spt.contains(upage) {
            return Err("segment page already tracked");
        }
        spt.insert(
            upage,
            SptEntry::lazy(FileInfo {
                file: file.reopen(),
                offset,
                read_bytes,
                zero_bytes,
                writable,
                map_id: None,
            }),
        );
        Ok(())
    }

    /// Map `file` at `start_page`. Every page of the file becomes an
    /// unloaded mapped-file page carrying its own reopened handle. Returns
    /// the mapping id.
    pub fn mmap(&self, file: &DiskFile, start_page: u64) -> Result<u64, &'static str> {
        let length = file.length();
        if length == 0 {
            return Err("mmap: zero-length file");
        }
        if start_page == 0 {
            return Err("mmap: null address");
        }
        if !is_page_aligned(start_page) {
            return Err("mmap: address not page-aligned");
        }
        let pages = (length as u64 + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        let end = start_page
            .checked_add(pages * PAGE_SIZE as u64)
            .ok_or("mmap: range overflows")?;
        if end > PHYS_BASE {
            return Err("mmap: range leaves user space");
        }

        let mut spt = self.spt.lock();
        {
            let mapper = self.mapper.lock();
            for i in 0..pages {
                let page = start_page + i * PAGE_SIZE as u64;
                if spt.contains(page) || mapper.is_present(page) {
                    return Err("mmap: page already in use");
                }
            }
        }

        let map_id = spt.alloc_map_id();
        let mut offset = 0u32;
        while offset < length {
            let read_bytes = (length - offset).min(PAGE_SIZE as u32);
            spt.insert(
                start_page + offset as u64,
                SptEntry::mmf(FileInfo {
                    file: file.reopen(),
                    offset,
                    read_bytes,
                    zero_bytes: PAGE_SIZE as u32 - read_bytes,
                    writable: true,
                    map_id: Some(map_id),
                }),
            );
            offset = offset.saturating_add(PAGE_SIZE as u32);
        }
        log::debug!(
            "[VM] mmap id {} at {:#x}: {} pages, {} bytes",
            map_id,
            start_page,
            pages,
            length
        );
        Ok(map_id)
    }

    /// Tear down mapping `map_id`: flush resident dirty pages to the file,
    /// release frames and swap slots, close the per-page file handles.
    /// A second call with the same id is a no-op.
    pub fn munmap(&self, map_id: u64) {
        let removed = self.spt.lock().take_by_map_id(map_id);
        if removed.is_empty() {
            return;
        }
        log::debug!("[VM] munmap id {}: {} pages", map_id, removed.len());

        for (page, entry) in removed {
            match entry.presence {
                Presence::Present => {
                    let info = entry.file_info().expect("mapped page without a file");
                    let (kpage, dirty) = {
                        let mapper = self.mapper.lock();
                        (mapper.lookup(page), mapper.is_dirty(page))
                    };
                    let Some(kpage) = kpage else { continue };
                    if dirty {
                        // Safety: resident mapped page owned by this space.
                        let frame = unsafe { self.frames.frame_slice(kpage) };
                        let _fs = vfs::fs_lock();
                        info.file
                            .write_at(info.offset, &frame[..info.read_bytes as usize]);
                    }
                    self.mapper.lock().unmap(page);
                    self.frames.remove_owner(kpage, self.id, page);
                }
                Presence::Swapped(slot) => self.frames.swap().swap_free(slot),
                Presence::Unloaded => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Process-exit hook: unmap every outstanding mapping, release swap
    /// slots and frames of the remaining tracked pages, then drop the
    /// untracked resident pages (the stack) from the frame table.
    pub fn exit(&self) {
        loop {
            // Scoped so the lock is not held across the munmap call.
            let id = { self.spt.lock().any_map_id() };
            let Some(id) = id else { break };
            self.munmap(id);
        }

        let leftover = self.spt.lock().drain_all();
        for (page, entry) in leftover {
            match entry.presence {
                Presence::Swapped(slot) => self.frames.swap().swap_free(slot),
                Presence::Present => {
                    let kpage = {
                        let mut mapper = self.mapper.lock();
                        let kpage = mapper.lookup(page);
                        mapper.unmap(page);
                        kpage
                    };
                    if let Some(kpage) = kpage {
                        self.frames.remove_owner(kpage, self.id, page);
                    }
                }
                Presence::Unloaded => {}
            }
        }

        self.frames.release_space(self.id);
    }

    // ------------------------------------------------------------------
    // User memory access
    // ------------------------------------------------------------------

    /// Copy `buf` into user memory at `vaddr`, faulting pages in and
    /// maintaining accessed/dirty bits as the MMU would. Fails if any page
    /// cannot be resolved or is not writable.
    pub fn copy_to_user(self: &Arc<Self>, vaddr: u64, buf: &[u8]) -> Result<(), &'static str> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr + done as u64;
            let page = page_round_down(addr);
            let off = (addr - page) as usize;
            let chunk = (PAGE_SIZE - off).min(buf.len() - done);

            let kpage = self.resolve_page(addr, true)?;
            // Safety: resident page owned by this space.
            let frame = unsafe { self.frames.frame_slice(kpage) };
            frame[off..off + chunk].copy_from_slice(&buf[done..done + chunk]);
            {
                let mut mapper = self.mapper.lock();
                mapper.set_accessed(page, true);
                mapper.set_dirty(page, true);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copy user memory at `vaddr` into `buf`, faulting pages in as
    /// needed.
    pub fn copy_from_user(
        self: &Arc<Self>,
        vaddr: u64,
        buf: &mut [u8],
    ) -> Result<(), &'static str> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr + done as u64;
            let page = page_round_down(addr);
            let off = (addr - page) as usize;
            let chunk = (PAGE_SIZE - off).min(buf.len() - done);

            let kpage = self.resolve_page(addr, false)?;
            // Safety: resident page owned by this space.
            let frame = unsafe { self.frames.frame_slice(kpage) };
            buf[done..done + chunk].copy_from_slice(&frame[off..off + chunk]);
            self.mapper.lock().set_accessed(page, true);
            done += chunk;
        }
        Ok(())
    }

    /// Resolve `vaddr` to its frame, faulting it in if necessary.
    fn resolve_page(self: &Arc<Self>, vaddr: u64, write: bool) -> Result<u64, &'static str> {
        if !is_user_vaddr(vaddr) {
            return Err("address outside user space");
        }
        let page = page_round_down(vaddr);
        loop {
            {
                let mapper = self.mapper.lock();
                if let Some(kpage) = mapper.lookup(page) {
                    if write && !mapper.is_writable(page) {
                        return Err("write to read-only page");
                    }
                    return Ok(kpage);
                }
            }
            if !self.handle_page_fault(vaddr, self.user_esp.load(Ordering::Relaxed)) {
                return Err("unresolvable page fault");
            }
        }
    }
}

impl Drop for VmSpace {
    fn drop(&mut self) {
        // Explicit exit() normally runs first; this sweep is idempotent
        // and covers spaces dropped without one.
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use crate::memory::paging::SoftPageTable;
    use crate::memory::swap::SwapTable;
    use crate::vfs::BufferCache;

    fn setup(user_frames: usize) -> (Arc<FrameTable>, Arc<BufferCache>) {
        let fs_disk = Arc::new(RamDisk::new(2048));
        let swap_disk = Arc::new(RamDisk::new(2048));
        let cache = Arc::new(BufferCache::new(fs_disk));
        let swap = Arc::new(SwapTable::new(swap_disk));
        (Arc::new(FrameTable::new(user_frames, swap)), cache)
    }

    fn space(frames: &Arc<FrameTable>) -> Arc<VmSpace> {
        VmSpace::new(frames.clone(), Box::new(SoftPageTable::new()))
    }

    #[test]
    fn test_mmap_argument_validation() {
        let (frames, cache) = setup(8);
        let s = space(&frames);
        let file = DiskFile::new(cache.clone(), 0, 8192);
        let empty = DiskFile::new(cache.clone(), 0, 0);

        assert!(s.mmap(&empty, 0x10000).is_err());
        assert!(s.mmap(&file, 0).is_err());
        assert!(s.mmap(&file, 0x10001).is_err());
        assert!(s.mmap(&file, 0x10000).is_ok());
        // Overlapping second mapping is rejected.
        assert!(s.mmap(&file, 0x11000).is_err());
    }

    #[test]
    fn test_munmap_is_idempotent() {
        let (frames, cache) = setup(8);
        let s = space(&frames);
        let file = DiskFile::new(cache, 0, 4096);
        let id = s.mmap(&file, 0x40000).unwrap();
        assert_eq!(s.tracked_pages(), 1);
        s.munmap(id);
        assert_eq!(s.tracked_pages(), 0);
        s.munmap(id); // no-op
        assert_eq!(s.tracked_pages(), 0);
    }

    #[test]
    fn test_stack_growth_heuristic_boundaries() {
        let (frames, _) = setup(16);
        let s = space(&frames);
        let esp = PHYS_BASE - 0x2000;
        s.set_user_esp(esp);

        // Exactly esp − 32 grows the stack.
        assert!(s.handle_page_fault(esp - 32, esp));
        // Far below esp does not.
        assert!(!s.handle_page_fault(esp - 0x10000, esp));
        // Beyond the stack limit does not, even right at the new esp.
        let deep = PHYS_BASE - MAX_STACK - 0x1000;
        assert!(!s.handle_page_fault(deep, deep));
        // Kernel addresses never resolve.
        assert!(!s.handle_page_fault(PHYS_BASE + 0x1000, esp));
        assert!(!s.handle_page_fault(0, esp));
    }

    #[test]
    fn test_lazy_segment_faults_in_with_zero_tail() {
        let (frames, cache) = setup(8);
        let s = space(&frames);
        let file = DiskFile::new(cache, 4, 4096);
        file.write_at(0, &[0x5Au8; 100]);

        s.register_segment(&file, 0, 0x80000, 100, PAGE_SIZE as u32 - 100, true)
            .unwrap();
        let mut buf = [0u8; 256];
        s.copy_from_user(0x80000, &mut buf).unwrap();
        assert_eq!(&buf[..100], &[0x5Au8; 100]);
        assert!(buf[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_to_read_only_segment_fails() {
        let (frames, cache) = setup(8);
        let s = space(&frames);
        let file = DiskFile::new(cache, 4, 4096);
        s.register_segment(&file, 0, 0x80000, 4096, 0, false).unwrap();
        assert!(s.copy_to_user(0x80000, &[1u8; 8]).is_err());
    }
}
