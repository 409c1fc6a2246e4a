//! Buffer cache end-to-end: daemons, read-ahead, persistence.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ridgeos_kernel::device::{BlockDevice, RamDisk, SECTOR_SIZE};
use ridgeos_kernel::vfs::block_cache::CACHE_SIZE;
use ridgeos_kernel::vfs::BufferCache;

fn sleep_ms(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}

fn pattern(seed: u8) -> [u8; SECTOR_SIZE] {
    let mut buf = [0u8; SECTOR_SIZE];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = seed.wrapping_mul(31).wrapping_add(i as u8);
    }
    buf
}

#[test]
fn fill_write_evict_read_back() {
    let disk = Arc::new(RamDisk::new(4096));
    let cache = Arc::new(BufferCache::new(disk));

    let n = CACHE_SIZE as u32;
    for s in 0..n {
        cache.write(s, &pattern(s as u8), 0, SECTOR_SIZE);
    }
    for s in 0..n {
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(s, &mut out, 0, SECTOR_SIZE);
        assert_eq!(out, pattern(s as u8));
    }

    // One more sector forces an eviction of some resident entry...
    cache.write(n, &pattern(200), 0, SECTOR_SIZE);
    assert!(cache.stats().evictions >= 1);

    // ...but every sector still reads back correctly, disk-backed or not.
    for s in 0..=n {
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(s, &mut out, 0, SECTOR_SIZE);
        let want = if s == n { pattern(200) } else { pattern(s as u8) };
        assert_eq!(out, want, "sector {}", s);
    }
}

#[test]
fn read_ahead_daemon_turns_read_into_hit() {
    let disk = Arc::new(RamDisk::new(256));
    disk.write(99, &pattern(9)).unwrap();
    let cache = Arc::new(BufferCache::new(disk));

    let daemon = {
        let c = cache.clone();
        thread::spawn(move || c.read_ahead_daemon())
    };

    cache.request_read_ahead(99);
    // Give the daemon a moment to populate the entry.
    let mut waited = 0;
    while !cache.contains(99) && waited < 2000 {
        sleep_ms(5);
        waited += 5;
    }
    assert!(cache.contains(99), "daemon never populated the sector");

    let reads_before = cache.stats().disk_reads;
    let mut out = [0u8; SECTOR_SIZE];
    cache.read(99, &mut out, 0, SECTOR_SIZE);
    assert_eq!(out, pattern(9));
    assert_eq!(
        cache.stats().disk_reads,
        reads_before,
        "read after read-ahead should not touch the disk"
    );

    cache.shutdown();
    daemon.join().unwrap();
}

#[test]
fn flush_daemon_writes_back_periodically() {
    let disk = Arc::new(RamDisk::new(256));
    let cache = Arc::new(BufferCache::new(disk.clone()));

    let daemon = {
        let c = cache.clone();
        thread::spawn(move || c.flush_daemon(10, sleep_ms))
    };

    cache.write(17, &pattern(3), 0, SECTOR_SIZE);
    let mut waited = 0;
    let mut raw = [0u8; SECTOR_SIZE];
    loop {
        disk.read(17, &mut raw).unwrap();
        if raw == pattern(3) || waited >= 2000 {
            break;
        }
        sleep_ms(10);
        waited += 10;
    }
    assert_eq!(raw, pattern(3), "daemon never flushed the dirty sector");

    cache.shutdown();
    daemon.join().unwrap();
}

#[test]
fn cache_survives_writer_and_reader_threads_with_daemons() {
    let disk = Arc::new(RamDisk::new(4096));
    let cache = Arc::new(BufferCache::new(disk));

    let flusher = {
        let c = cache.clone();
        thread::spawn(move || c.flush_daemon(5, sleep_ms))
    };
    let reader_ahead = {
        let c = cache.clone();
        thread::spawn(move || c.read_ahead_daemon())
    };

    let mut workers = Vec::new();
    for t in 0..4u32 {
        let c = cache.clone();
        workers.push(thread::spawn(move || {
            let base = 100 + t * 50;
            for round in 0..6u8 {
                for s in base..base + 50 {
                    c.write(s, &pattern(s as u8 ^ round), 0, SECTOR_SIZE);
                    c.request_read_ahead(s + 1);
                }
                for s in base..base + 50 {
                    let mut out = [0u8; SECTOR_SIZE];
                    c.read(s, &mut out, 0, SECTOR_SIZE);
                    assert_eq!(out, pattern(s as u8 ^ round));
                }
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    cache.shutdown();
    flusher.join().unwrap();
    reader_ahead.join().unwrap();
}
