//! Block device layer
//!
//! Sector-addressed storage contracts consumed by the buffer cache and the
//! swap manager. Real drivers live below this interface; `RamDisk` is the
//! reference backend used by the boot path when no disk is present and by
//! the self-tests.

pub mod block;
pub mod ramdisk;

pub use block::{BlockDevice, BlockError, Sector, SECTOR_SIZE};
pub use ramdisk::RamDisk;
