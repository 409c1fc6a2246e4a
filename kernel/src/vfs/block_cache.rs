//! Buffer cache — bounded write-back sector cache
//!
//! All filesystem I/O goes through a fixed array of sector-sized entries.
//! Lookups are concurrent: the index lock only covers the sector→entry
//! mapping and the clock hand, while each entry carries its own lock for
//! the payload. Eviction is a modified clock that gives dirty entries one
//! extra pass, because evicting a dirty entry costs a disk write.
//!
//! Lock discipline inside this module: an entry lock may be acquired with
//! the index lock held only via try-lock. Any path that must *block* on an
//! entry lock (eviction round 2, `remove`) drops the index lock first and
//! revalidates after it reacquires it. Threads holding an entry lock may
//! take the index lock; the reverse never blocks, so the pair cannot
//! deadlock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use crossbeam_queue::ArrayQueue;
use spin::{Mutex, MutexGuard, RwLock, RwLockWriteGuard};

use crate::device::{BlockDevice, Sector, SECTOR_SIZE};
use crate::sync::Semaphore;

/// Number of cache entries (sectors held in memory).
pub const CACHE_SIZE: usize = 64;

/// Capacity of the read-ahead request ring.
pub const MAX_READ_AHEAD: usize = 8;

/// Default flush-daemon period.
pub const FLUSH_INTERVAL_MS: u64 = 1000;

/// Sentinel for an entry holding no sector. Sector 0 is valid and cacheable.
pub const EMPTY_SECTOR: Sector = Sector::MAX;

struct CacheEntry {
    /// Sector held by this entry, or `EMPTY_SECTOR`. Mutated only with the
    /// index lock held.
    sector: AtomicU32,
    /// Payload differs from disk. Never set while `sector` is empty.
    dirty: AtomicBool,
    /// Clock bit: entry survives one scan, evicted on the next.
    second_chance: AtomicBool,
    /// In-progress readers copying out of `data`. Eviction skips the entry
    /// while nonzero.
    readers: AtomicU32,
    /// Per-entry lock and payload. Writers, miss-fills and eviction hold
    /// the write side; the readers' copy-out holds the read side.
    data: RwLock<[u8; SECTOR_SIZE]>,
}

impl CacheEntry {
    fn new() -> Self {
        CacheEntry {
            sector: AtomicU32::new(EMPTY_SECTOR),
            dirty: AtomicBool::new(false),
            second_chance: AtomicBool::new(false),
            readers: AtomicU32::new(0),
            data: RwLock::new([0u8; SECTOR_SIZE]),
        }
    }
}

/// Outcome of claiming a slot for a missing sector.
enum Claim<'a> {
    /// Slot locked and retagged to the requested sector; caller fills it.
    Claimed(usize, RwLockWriteGuard<'a, [u8; SECTOR_SIZE]>),
    /// Another thread cached the sector first; retry as a hit.
    Existing,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub evictions: u64,
    pub flushes: u64,
}

/// Write-back sector cache over one block device.
pub struct BufferCache {
    entries: Vec<CacheEntry>,
    /// Index lock: guards the sector→entry mapping and holds the clock hand.
    clock: Mutex<usize>,
    disk: Arc<dyn BlockDevice>,
    read_ahead: ArrayQueue<Sector>,
    rh_sema: Semaphore,
    shutdown: AtomicBool,
    counters: Counters,
}

impl BufferCache {
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let entries = (0..CACHE_SIZE).map(|_| CacheEntry::new()).collect();
        BufferCache {
            entries,
            clock: Mutex::new(0),
            disk,
            read_ahead: ArrayQueue::new(MAX_READ_AHEAD),
            rh_sema: Semaphore::new(0),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Read `len` bytes of `sector` starting at `offset` into `buf`.
    /// Blocks until the sector is cached; never returns partial data.
    pub fn read(&self, sector: Sector, buf: &mut [u8], offset: usize, len: usize) {
        assert!(offset + len <= SECTOR_SIZE, "cache read past sector end");
        debug_assert!(sector != EMPTY_SECTOR);

        loop {
            let found = {
                let _hand = self.clock.lock();
                self.find(sector)
            };
            match found {
                Some(i) => {
                    let entry = &self.entries[i];
                    let guard = entry.data.read();
                    if entry.sector.load(Ordering::Acquire) != sector {
                        // Evicted between the index scan and the entry
                        // lock; start over.
                        continue;
                    }
                    entry.readers.fetch_add(1, Ordering::AcqRel);
                    entry.second_chance.store(false, Ordering::Relaxed);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    buf[..len].copy_from_slice(&guard[offset..offset + len]);
                    entry.readers.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                None => match self.claim_slot(sector) {
                    Claim::Claimed(_, mut guard) => {
                        self.disk_read(sector, &mut guard);
                        buf[..len].copy_from_slice(&guard[offset..offset + len]);
                        return;
                    }
                    Claim::Existing => continue,
                },
            }
        }
    }

    /// Write `len` bytes into `sector` at `offset`, marking the entry
    /// dirty. A partial write to an uncached sector fetches it from disk
    /// first; a full-sector write starts from zeros.
    pub fn write(&self, sector: Sector, buf: &[u8], offset: usize, len: usize) {
        assert!(offset + len <= SECTOR_SIZE, "cache write past sector end");
        debug_assert!(sector != EMPTY_SECTOR);

        loop {
            let found = {
                let _hand = self.clock.lock();
                self.find(sector)
            };
            match found {
                Some(i) => {
                    let entry = &self.entries[i];
                    let mut guard = entry.data.write();
                    if entry.sector.load(Ordering::Acquire) != sector {
                        continue;
                    }
                    entry.dirty.store(true, Ordering::Release);
                    entry.second_chance.store(false, Ordering::Relaxed);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    guard[offset..offset + len].copy_from_slice(&buf[..len]);
                    return;
                }
                None => match self.claim_slot(sector) {
                    Claim::Claimed(i, mut guard) => {
                        if offset > 0 || offset + len < SECTOR_SIZE {
                            // The sector holds bytes outside the chunk
                            // being written; bring them in first.
                            self.disk_read(sector, &mut guard);
                        } else {
                            guard.fill(0);
                        }
                        self.entries[i].dirty.store(true, Ordering::Release);
                        guard[offset..offset + len].copy_from_slice(&buf[..len]);
                        return;
                    }
                    Claim::Existing => continue,
                },
            }
        }
    }

    /// Non-blocking hint that `sector` will be read soon. The read-ahead
    /// daemon populates it asynchronously; a full ring drops the hint.
    pub fn request_read_ahead(&self, sector: Sector) {
        if self.read_ahead.push(sector).is_ok() {
            self.rh_sema.up();
        }
    }

    /// Write every dirty entry to disk. Returns when all are clean.
    pub fn flush_all(&self) {
        for entry in self.entries.iter() {
            let guard = entry.data.write();
            let sector = entry.sector.load(Ordering::Acquire);
            if sector != EMPTY_SECTOR && entry.dirty.load(Ordering::Acquire) {
                self.disk_write(sector, &guard);
                entry.dirty.store(false, Ordering::Release);
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop `sector` from the cache without flushing it. Used when the
    /// sector's backing object is deleted and its contents are dead.
    pub fn remove(&self, sector: Sector) {
        loop {
            let found = {
                let _hand = self.clock.lock();
                self.find(sector)
            };
            let Some(i) = found else { return };
            let entry = &self.entries[i];
            let guard = entry.data.write();
            let hand = self.clock.lock();
            if entry.sector.load(Ordering::Acquire) != sector {
                drop(hand);
                drop(guard);
                continue;
            }
            entry.sector.store(EMPTY_SECTOR, Ordering::Release);
            entry.dirty.store(false, Ordering::Relaxed);
            entry.second_chance.store(false, Ordering::Relaxed);
            return;
        }
    }

    /// Periodic flush loop. Runs on its own kernel thread; `sleep_ms`
    /// stands in for the timer. Exits after `shutdown`.
    pub fn flush_daemon(&self, interval_ms: u64, sleep_ms: fn(u64)) {
        log::debug!("[BCACHE] flush daemon running ({} ms period)", interval_ms);
        while !self.shutdown.load(Ordering::Acquire) {
            self.flush_all();
            sleep_ms(interval_ms);
        }
        log::debug!("[BCACHE] flush daemon stopped");
    }

    /// Read-ahead loop. Sleeps on the request semaphore, then resolves
    /// each pending sector as an ordinary miss (no-op on a hit). Exits
    /// after `shutdown`.
    pub fn read_ahead_daemon(&self) {
        log::debug!("[BCACHE] read-ahead daemon running");
        loop {
            self.rh_sema.down();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            while let Some(sector) = self.read_ahead.pop() {
                self.ensure_cached(sector);
            }
        }
        log::debug!("[BCACHE] read-ahead daemon stopped");
    }

    /// Raise the shutdown flag and wake the read-ahead daemon so both
    /// daemons observe it.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.rh_sema.up();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }

    /// Number of entries currently holding a sector.
    pub fn cached_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.sector.load(Ordering::Relaxed) != EMPTY_SECTOR)
            .count()
    }

    /// Number of dirty entries.
    pub fn dirty_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.dirty.load(Ordering::Relaxed))
            .count()
    }

    /// Whether `sector` is currently cached.
    pub fn contains(&self, sector: Sector) -> bool {
        let _hand = self.clock.lock();
        self.find(sector).is_some()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn find(&self, sector: Sector) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.sector.load(Ordering::Acquire) == sector)
    }

    /// Resolve a miss for the daemon: no-op if cached, otherwise claim a
    /// slot and fill it.
    fn ensure_cached(&self, sector: Sector) {
        let hit = {
            let _hand = self.clock.lock();
            self.find(sector).is_some()
        };
        if hit {
            return;
        }
        if let Claim::Claimed(_, mut guard) = self.claim_slot(sector) {
            self.disk_read(sector, &mut guard);
        }
    }

    /// Find a slot for `sector` via the modified clock, returning it
    /// locked and already retagged. Round 0 spares dirty entries; rounds
    /// ≥ 1 set second-chance unconditionally; round ≥ 2 may block on a
    /// contended entry (with the index lock released). Three fruitless
    /// rounds mean a stuck cache and panic.
    fn claim_slot(&self, sector: Sector) -> Claim<'_> {
        let mut round = 0;
        loop {
            let mut hand = self.clock.lock();
            if self.find(sector).is_some() {
                return Claim::Existing;
            }
            let mut contended: Option<usize> = None;
            for step in 0..CACHE_SIZE {
                let i = (*hand + step) % CACHE_SIZE;
                let entry = &self.entries[i];
                if entry.readers.load(Ordering::Acquire) > 0 {
                    continue;
                }
                let empty = entry.sector.load(Ordering::Acquire) == EMPTY_SECTOR;
                if empty || entry.second_chance.load(Ordering::Relaxed) {
                    if let Some(guard) = entry.data.try_write() {
                        if entry.readers.load(Ordering::Acquire) == 0 {
                            *hand = (i + 1) % CACHE_SIZE;
                            return self.install(hand, i, guard, sector);
                        }
                    } else if round >= 2 {
                        contended = Some(i);
                        break;
                    }
                } else if round > 0 || !entry.dirty.load(Ordering::Relaxed) {
                    entry.second_chance.store(true, Ordering::Relaxed);
                }
            }
            drop(hand);

            if let Some(i) = contended {
                // Block on the busy entry without the index lock, then
                // revalidate: it may have been retagged or gained readers
                // while we waited.
                let entry = &self.entries[i];
                let guard = entry.data.write();
                let mut hand = self.clock.lock();
                if self.find(sector).is_some() {
                    return Claim::Existing;
                }
                let empty = entry.sector.load(Ordering::Acquire) == EMPTY_SECTOR;
                if entry.readers.load(Ordering::Acquire) == 0
                    && (empty || entry.second_chance.load(Ordering::Relaxed))
                {
                    *hand = (i + 1) % CACHE_SIZE;
                    return self.install(hand, i, guard, sector);
                }
                continue;
            }

            round += 1;
            assert!(round < 3, "buffer cache: no evictable entry after 3 rounds");
        }
    }

    /// Retag a locked victim to `sector`. A dirty victim is written back
    /// first with the index lock released; its old mapping stays visible
    /// during the write-back so no concurrent lookup can re-read stale
    /// disk contents.
    fn install<'a>(
        &'a self,
        hand: MutexGuard<'a, usize>,
        i: usize,
        guard: RwLockWriteGuard<'a, [u8; SECTOR_SIZE]>,
        sector: Sector,
    ) -> Claim<'a> {
        let entry = &self.entries[i];
        let old = entry.sector.load(Ordering::Acquire);

        if old != EMPTY_SECTOR && entry.dirty.load(Ordering::Acquire) {
            drop(hand);
            self.disk_write(old, &guard);
            entry.dirty.store(false, Ordering::Release);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);

            let _hand = self.clock.lock();
            if self.find(sector).is_some() {
                // Lost the race while flushing. The entry is clean and
                // still maps `old`, so it stays usable as-is.
                return Claim::Existing;
            }
            entry.sector.store(sector, Ordering::Release);
            entry.second_chance.store(false, Ordering::Relaxed);
        } else {
            if old != EMPTY_SECTOR {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
            entry.sector.store(sector, Ordering::Release);
            entry.second_chance.store(false, Ordering::Relaxed);
            entry.dirty.store(false, Ordering::Relaxed);
            drop(hand);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Claim::Claimed(i, guard)
    }

    fn disk_read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) {
        self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.disk.read(sector, buf) {
            panic!("[BCACHE] disk read of sector {} failed: {:?}", sector, e);
        }
    }

    fn disk_write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) {
        self.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.disk.write(sector, buf) {
            panic!("[BCACHE] disk write of sector {} failed: {:?}", sector, e);
        }
    }
}
