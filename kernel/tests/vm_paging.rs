//! VM end-to-end: mapped files, forced swap, stack growth, teardown.

use std::sync::Arc;

use ridgeos_kernel::device::RamDisk;
use ridgeos_kernel::memory::paging::SoftPageTable;
use ridgeos_kernel::memory::{VmSpace, MAX_STACK, PAGE_SIZE, PHYS_BASE};
use ridgeos_kernel::vfs::DiskFile;
use ridgeos_kernel::Kernel;

fn kernel(user_frames: usize) -> Kernel {
    // 1 MB filesystem device, 16 MB swap device.
    Kernel::new(
        Arc::new(RamDisk::new(2048)),
        Arc::new(RamDisk::new(32768)),
        user_frames,
    )
}

fn space(k: &Kernel) -> Arc<VmSpace> {
    k.create_space(Box::new(SoftPageTable::new()))
}

/// Addresses in the top stack region satisfy the growth heuristic once
/// esp sits at the region's bottom.
fn stack_base(s: &Arc<VmSpace>) -> u64 {
    let base = PHYS_BASE - MAX_STACK;
    s.set_user_esp(base);
    base
}

#[test]
fn mmap_large_file_touch_all_munmap_round_trip() {
    let k = kernel(8);
    let s = space(&k);

    // 128 KB file = 32 pages, far more than the 8-frame pool: touching
    // every byte forces mapped-file eviction traffic through the cache.
    let len: u32 = 128 * 1024;
    let file = DiskFile::new(k.cache.clone(), 0, len);
    let start: u64 = 0x2000_0000;

    let id = s.mmap(&file, start).unwrap();

    let mutation: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    for page in 0..(len as usize / PAGE_SIZE) {
        let off = page * PAGE_SIZE;
        s.copy_to_user(start + off as u64, &mutation[off..off + PAGE_SIZE])
            .unwrap();
    }

    s.munmap(id);
    assert_eq!(s.tracked_pages(), 0);

    // Reopen and read the file back: it must hold the last mutation.
    let reread = file.reopen();
    let mut out = vec![0u8; len as usize];
    assert_eq!(reread.read_at(0, &mut out), len as usize);
    assert_eq!(out, mutation);
}

#[test]
fn mmap_trailing_page_reads_zero_past_eof() {
    let k = kernel(8);
    let s = space(&k);

    // 5000 bytes: one full page plus a 904-byte tail.
    let file = DiskFile::new(k.cache.clone(), 0, 5000);
    let content: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8 + 1).collect();
    file.write_at(0, &content);

    let start: u64 = 0x3000_0000;
    s.mmap(&file, start).unwrap();

    let mut tail = vec![0u8; PAGE_SIZE];
    s.copy_from_user(start + PAGE_SIZE as u64, &mut tail).unwrap();
    assert_eq!(&tail[..904], &content[4096..5000]);
    assert!(tail[904..].iter().all(|&b| b == 0), "tail must read as zeros");
}

#[test]
fn forced_swap_faults_back_with_original_contents() {
    let k = kernel(4);
    let s = space(&k);
    let base = stack_base(&s);

    // Eight anonymous pages against a four-frame pool.
    let pages = 8usize;
    for p in 0..pages {
        let buf = vec![(p as u8) ^ 0x3C; PAGE_SIZE];
        s.copy_to_user(base + (p * PAGE_SIZE) as u64, &buf).unwrap();
    }

    // Something must have gone to swap, and the swap bitmap must agree
    // with the page tracking.
    assert!(k.frames.evictions() >= (pages - 4) as u64);
    assert!(s.swapped_pages() > 0);
    assert_eq!(s.swapped_pages(), k.swap.used_slots());

    // Fault everything back in (evicting other pages on the way) and
    // check the contents survived the round trip.
    for p in 0..pages {
        let mut out = vec![0u8; PAGE_SIZE];
        s.copy_from_user(base + (p * PAGE_SIZE) as u64, &mut out).unwrap();
        assert_eq!(out, vec![(p as u8) ^ 0x3C; PAGE_SIZE], "page {}", p);
    }
    assert_eq!(s.swapped_pages(), k.swap.used_slots());
}

#[test]
fn stack_grows_until_limit_then_faults() {
    let k = kernel(64);
    let s = space(&k);

    // Push the stack down one page at a time, esp tracking the access.
    let top = PHYS_BASE - PAGE_SIZE as u64;
    let pages = (MAX_STACK as usize) / PAGE_SIZE;
    for p in 0..pages {
        let vaddr = top - (p * PAGE_SIZE) as u64 + 8;
        assert!(
            s.handle_page_fault(vaddr, vaddr),
            "growth failed at page {} ({:#x})",
            p,
            vaddr
        );
    }

    // The next page down exceeds MAX_STACK: the fault is unresolvable.
    let beyond = top - (pages * PAGE_SIZE) as u64 + 8;
    assert!(!s.handle_page_fault(beyond, beyond));

    s.exit();
    let (_, used) = k.frames.stats();
    assert_eq!(used, 0);
    assert_eq!(k.swap.used_slots(), 0);
}

#[test]
fn spaces_do_not_leak_into_each_other_under_eviction() {
    let k = kernel(4);
    let a = space(&k);
    let b = space(&k);
    let base_a = stack_base(&a);
    let base_b = stack_base(&b);

    for p in 0..4usize {
        a.copy_to_user(base_a + (p * PAGE_SIZE) as u64, &vec![0xAA; PAGE_SIZE])
            .unwrap();
        b.copy_to_user(base_b + (p * PAGE_SIZE) as u64, &vec![0xBB; PAGE_SIZE])
            .unwrap();
    }

    for p in 0..4usize {
        let mut out = vec![0u8; PAGE_SIZE];
        a.copy_from_user(base_a + (p * PAGE_SIZE) as u64, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0xAA));
        b.copy_from_user(base_b + (p * PAGE_SIZE) as u64, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0xBB));
    }
}

#[test]
fn exit_releases_frames_swap_and_file_mappings() {
    let k = kernel(4);
    let s = space(&k);
    let base = stack_base(&s);

    // Anonymous pages (some swapped) ...
    for p in 0..6usize {
        s.copy_to_user(base + (p * PAGE_SIZE) as u64, &vec![7u8; PAGE_SIZE])
            .unwrap();
    }
    // ... plus an outstanding mapped file that exit must unmap itself.
    let file = DiskFile::new(k.cache.clone(), 64, 8192);
    s.mmap(&file, 0x4000_0000).unwrap();
    s.copy_to_user(0x4000_0000, &vec![0xEE; 16]).unwrap();

    s.exit();

    let (_, used) = k.frames.stats();
    assert_eq!(used, 0, "all frames must be released at exit");
    assert_eq!(k.swap.used_slots(), 0, "all swap slots must be released");
    assert_eq!(s.tracked_pages(), 0);

    // The dirty mapped page was flushed on the unmap path.
    let mut out = [0u8; 16];
    file.read_at(0, &mut out);
    assert_eq!(out, [0xEE; 16]);
}
