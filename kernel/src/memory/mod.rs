//! Virtual-memory core
//!
//! Physical user-frame pool with global clock eviction, per-address-space
//! page tracking for demand paging, and the swap-slot manager. The page
//! fault path, mmap/munmap and process teardown live in `vmspace`.

pub mod frame;
pub mod page;
pub mod paging;
pub mod swap;
pub mod vmspace;

pub use frame::{AllocFlags, FrameTable};
pub use paging::{PageMapper, SoftPageTable};
pub use swap::SwapTable;
pub use vmspace::VmSpace;

/// Page / frame size (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page on the swap device.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / crate::device::SECTOR_SIZE;

/// First address above user space. User pages live below this.
pub const PHYS_BASE: u64 = 0xC000_0000;

/// Upper bound on stack growth (8 MB below PHYS_BASE).
pub const MAX_STACK: u64 = 8 * 1024 * 1024;

/// Round an address down to its page boundary.
pub const fn page_round_down(vaddr: u64) -> u64 {
    vaddr & !(PAGE_SIZE as u64 - 1)
}

/// Whether `vaddr` is a page-aligned address.
pub const fn is_page_aligned(vaddr: u64) -> bool {
    vaddr % PAGE_SIZE as u64 == 0
}

/// Whether `vaddr` lies in user space.
pub const fn is_user_vaddr(vaddr: u64) -> bool {
    vaddr < PHYS_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_math() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_down(0x1000), 0x1000);
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2001));
        assert!(is_user_vaddr(PHYS_BASE - 1));
        assert!(!is_user_vaddr(PHYS_BASE));
    }
}
