//! RidgeOS kernel core: buffer cache + virtual memory
//!
//! The paging and file-caching heart of the kernel: a write-back sector
//! cache over the filesystem device, a user frame pool with global clock
//! eviction, per-process page tracking for swap / mapped files / lazy
//! segments, and the swap-slot manager. Hardware sits behind contracts
//! (`device::BlockDevice`, `memory::PageMapper`); the scheduler, syscall
//! dispatch and the filesystem proper live in the surrounding kernel.
//!
//! Init order matters and `Kernel::new` enforces it: buffer cache over the
//! FS device first, then the swap table over the swap device, then the
//! frame table (eviction needs swap). Daemon loops are started by the
//! embedder on kernel threads and stopped through `BufferCache::shutdown`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod device;
pub mod memory;
pub mod sync;
pub mod vfs;

use alloc::boxed::Box;
use alloc::sync::Arc;

use device::BlockDevice;
use memory::paging::PageMapper;
use memory::{FrameTable, SwapTable, VmSpace};
use vfs::BufferCache;

/// The wired-up VM/FS core.
pub struct Kernel {
    pub cache: Arc<BufferCache>,
    pub swap: Arc<SwapTable>,
    pub frames: Arc<FrameTable>,
}

impl Kernel {
    /// Bring the core up over the two block devices, with a user pool of
    /// `user_frames` frames.
    pub fn new(
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
        user_frames: usize,
    ) -> Self {
        let cache = Arc::new(BufferCache::new(fs_dev));
        let swap = Arc::new(SwapTable::new(swap_dev));
        let frames = Arc::new(FrameTable::new(user_frames, swap.clone()));
        log::info!("[KERNEL] VM core up: {} user frames", user_frames);
        Kernel {
            cache,
            swap,
            frames,
        }
    }

    /// Create an address space over the given hardware page table.
    pub fn create_space(&self, mapper: Box<dyn PageMapper>) -> Arc<VmSpace> {
        VmSpace::new(self.frames.clone(), mapper)
    }

    /// Flush all dirty cache entries and stop the daemons. The embedder
    /// joins the daemon threads afterwards.
    pub fn shutdown(&self) {
        self.cache.flush_all();
        self.cache.shutdown();
    }
}
