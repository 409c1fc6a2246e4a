//! Filesystem layer: global FS lock, sector cache, extent files
//!
//! The filesystem proper (directories, inodes, allocation) sits above this
//! crate. What lives here is the part the VM core depends on: the single
//! coarse mutex that serializes filesystem calls, the write-back sector
//! cache, and the extent-file object memory-mapped pages read and flush
//! through.

pub mod block_cache;
pub mod file;

pub use block_cache::{BufferCache, CacheStats, EMPTY_SECTOR};
pub use file::DiskFile;

use spin::{Mutex, MutexGuard};

/// The global filesystem mutex. The filesystem below this layer is not
/// itself MT-safe, so every file-level operation serializes on it.
///
/// Lock order: taken after the frame-table and swap locks, before any
/// buffer-cache lock.
static FILES_LOCK: Mutex<()> = Mutex::new(());

/// RAII guard for the filesystem lock.
pub type FsGuard = MutexGuard<'static, ()>;

/// Acquire the global filesystem lock.
pub fn fs_lock() -> FsGuard {
    FILES_LOCK.lock()
}

/// Acquire the filesystem lock, leaving release to `unlock_fs`.
pub fn lock_fs() {
    core::mem::forget(FILES_LOCK.lock());
}

/// Release the filesystem lock taken with `lock_fs`.
///
/// # Safety
/// The caller must hold the lock via a prior `lock_fs`.
pub unsafe fn unlock_fs() {
    FILES_LOCK.force_unlock();
}
