//! The buffer cache.
//!
//! A fixed pool of [`MAX_CACHE_SIZE`] sector-sized buffers between the inode
//! layer and the disk. The cache is **write-back**: `write` marks the buffer
//! dirty and returns; the data reaches the device when the background
//! flusher sweeps it, when the entry is evicted, or at the final
//! [`Cache::flush`]. A global least-recently-used order across the pool
//! picks eviction victims.
//!
//! Per entry, two independent pieces of state:
//! - the **slot** (a spinlock): the cached sector's identity, the flag bits,
//!   and a pin count of requests holding the entry between lookup and
//!   release;
//! - the **rw-state** (a sleeping mutex + condition variable): the
//!   reader/writer protocol over the buffer bytes: writers exclusive,
//!   readers shared, no reader/writer overlap.
//!
//! Lookup scans the pool against a racy identity mirror and re-validates
//! under the slot lock, so identity is always sound even though the scan is
//! unlocked. A miss claims a free entry under a single assignment lock, so
//! two threads missing on the same sector converge on one entry.
//!
//! Every miss also spawns a short-lived read-ahead helper for the next
//! sector. The helper signals a rendezvous semaphore as soon as it has
//! claimed (or declined to claim) its slot, before any device I/O, so the
//! primary request never waits out the speculative read.
//!
//! Device I/O failures are fatal: a buffer the device refuses to take marks
//! the whole filesystem state suspect.

use crate::{FLUSH_INTERVAL, MAX_CACHE_SIZE, SECTOR_SIZE, disk_layout::RAW_NONE};
use aspen::{
    fs::{Disk, Sector},
    sync::{ConditionVariable, Mutex, Semaphore, SpinLock},
    thread::{JoinHandle, ThreadBuilder},
};
use bitflags::bitflags;
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};
use std::sync::Arc;

bitflags! {
    /// Flag bits of a cache entry, guarded by the entry's slot lock.
    struct EntryFlags: u8 {
        /// The entry participates in the pool (always set; cleared state is
        /// never stored).
        const VALID = 1 << 0;
        /// A miss is filling this entry from the device.
        const BUSY  = 1 << 1;
        /// The buffer is newer than the device copy.
        const DIRTY = 1 << 2;
    }
}

struct Slot {
    sector: Option<Sector>,
    flags: EntryFlags,
    /// Requests holding the entry between lookup and release. A pinned
    /// entry is never evicted or reassigned.
    pins: usize,
}

struct RwState {
    readers: usize,
    writer: bool,
}

struct Entry {
    /// Unlocked mirror of the slot's sector for the racy lookup scan.
    ident: AtomicU32,
    slot: SpinLock<Slot>,
    rw: Mutex<RwState>,
    cond: ConditionVariable,
    data: UnsafeCell<[u8; SECTOR_SIZE]>,
}

// SAFETY: `data` is only touched under the entry's reader/writer protocol
// (or with the slot locked and the rw-state proven idle, during eviction and
// the final flush).
unsafe impl Sync for Entry {}

impl Entry {
    fn new() -> Self {
        Entry {
            ident: AtomicU32::new(RAW_NONE),
            slot: SpinLock::new(Slot {
                sector: None,
                flags: EntryFlags::VALID,
                pins: 0,
            }),
            rw: Mutex::new(RwState {
                readers: 0,
                writer: false,
            }),
            cond: ConditionVariable::new(),
            data: UnsafeCell::new([0; SECTOR_SIZE]),
        }
    }

    /// Shared access: waits out a writer, then joins the reader side.
    fn reader_acquire(&self) {
        let mut guard = self.cond.wait_while(&self.rw, |s| s.writer);
        guard.readers += 1;
        guard.unlock();
    }

    fn reader_release(&self) {
        let mut guard = self.rw.lock();
        guard.readers -= 1;
        if guard.readers == 0 {
            self.cond.signal(guard);
        } else {
            guard.unlock();
        }
    }

    /// Exclusive access: waits until no writer and no readers remain.
    fn writer_acquire(&self) {
        let mut guard = self
            .cond
            .wait_while(&self.rw, |s| s.writer || s.readers > 0);
        guard.writer = true;
        guard.unlock();
    }

    fn writer_release(&self) {
        let mut guard = self.rw.lock();
        guard.writer = false;
        self.cond.broadcast(guard);
    }

    /// Whether nobody holds or awaits the buffer bytes right now.
    fn rw_idle(&self) -> bool {
        match self.rw.try_lock() {
            Ok(guard) => {
                let idle = guard.readers == 0 && !guard.writer;
                guard.unlock();
                idle
            }
            Err(_) => false,
        }
    }
}

const NIL: usize = usize::MAX;

/// Doubly-linked recency order over the pool, head = least recently used.
struct LruList {
    prev: [usize; MAX_CACHE_SIZE],
    next: [usize; MAX_CACHE_SIZE],
    head: usize,
    tail: usize,
}

impl LruList {
    fn new() -> Self {
        let mut list = LruList {
            prev: [NIL; MAX_CACHE_SIZE],
            next: [NIL; MAX_CACHE_SIZE],
            head: NIL,
            tail: NIL,
        };
        for i in 0..MAX_CACHE_SIZE {
            list.push_tail(i);
        }
        list
    }

    fn detach(&mut self, i: usize) {
        let (prev, next) = (self.prev[i], self.next[i]);
        if prev == NIL {
            self.head = next;
        } else {
            self.next[prev] = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.prev[next] = prev;
        }
        self.prev[i] = NIL;
        self.next[i] = NIL;
    }

    fn push_tail(&mut self, i: usize) {
        self.prev[i] = self.tail;
        self.next[i] = NIL;
        if self.tail == NIL {
            self.head = i;
        } else {
            self.next[self.tail] = i;
        }
        self.tail = i;
    }

    fn touch(&mut self, i: usize) {
        self.detach(i);
        self.push_tail(i);
    }

    /// Snapshot from least to most recently used.
    fn order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(MAX_CACHE_SIZE);
        let mut i = self.head;
        while i != NIL {
            order.push(i);
            i = self.next[i];
        }
        order
    }
}

pub(crate) struct CacheInner {
    disk: Disk,
    entries: Vec<Entry>,
    lru: SpinLock<LruList>,
    /// Serializes sector-to-entry assignment on misses.
    assign: SpinLock<()>,
    stop: AtomicBool,
}

impl CacheInner {
    fn touch(&self, i: usize) {
        let mut lru = self.lru.lock();
        lru.touch(i);
        lru.unlock();
    }

    fn read_device(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) {
        if self.disk.read(sector, buf).is_err() {
            panic!("device read failed at sector {}", sector.into_usize());
        }
    }

    fn write_device(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) {
        if self.disk.write(sector, buf).is_err() {
            panic!("device write failed at sector {}", sector.into_usize());
        }
    }

    /// Racy scan for `sector`; a hit is re-validated under the slot lock and
    /// returned pinned.
    fn pin_existing(&self, sector: Sector) -> Option<usize> {
        let raw = sector.into_usize() as u32;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.ident.load(Ordering::Relaxed) != raw {
                continue;
            }
            let mut slot = entry.slot.lock();
            if slot.sector == Some(sector) {
                slot.pins += 1;
                slot.unlock();
                return Some(i);
            }
            slot.unlock();
        }
        None
    }

    fn unpin(&self, i: usize) {
        let mut slot = self.entries[i].slot.lock();
        slot.pins -= 1;
        slot.unlock();
    }

    /// Claims a free entry for `sector`, evicting if the pool is full.
    ///
    /// The claimed entry comes back pinned, BUSY, and **writer-held**:
    /// requests that find it by identity before the fill completes sleep on
    /// the rw-state instead of observing stale bytes. Caller holds the
    /// assignment lock and must release the writer side after filling.
    fn take_free(&self, sector: Sector) -> usize {
        let i = loop {
            // A released entry first.
            let mut found = None;
            for (i, entry) in self.entries.iter().enumerate() {
                if let Ok(mut slot) = entry.slot.try_lock() {
                    if slot.sector.is_none() && slot.flags == EntryFlags::VALID && slot.pins == 0
                    {
                        slot.pins = 1;
                        slot.flags = EntryFlags::VALID | EntryFlags::BUSY;
                        slot.unlock();
                        found = Some(i);
                        break;
                    }
                    slot.unlock();
                }
            }
            if let Some(i) = found {
                break i;
            }
            if let Some(i) = self.evict() {
                let mut slot = self.entries[i].slot.lock();
                slot.pins = 1;
                slot.flags = EntryFlags::VALID | EntryFlags::BUSY;
                slot.unlock();
                break i;
            }
            // Everything is in use; someone will release soon.
            std::thread::yield_now();
        };
        let entry = &self.entries[i];
        // The entry is fresh, so this never waits; it must happen before
        // the identity becomes discoverable.
        entry.writer_acquire();
        let mut slot = entry.slot.lock();
        slot.sector = Some(sector);
        slot.unlock();
        entry.ident.store(sector.into_usize() as u32, Ordering::Relaxed);
        self.touch(i);
        i
    }

    /// Walks the LRU order and releases the first idle entry, writing it
    /// back first if dirty. Returns the freed index, or `None` when every
    /// candidate is in use.
    fn evict(&self) -> Option<usize> {
        let lru = self.lru.lock();
        let order = lru.order();
        lru.unlock();
        for i in order {
            let entry = &self.entries[i];
            let Ok(mut slot) = entry.slot.try_lock() else {
                continue;
            };
            let candidate = slot.sector.is_some()
                && slot.pins == 0
                && !slot.flags.contains(EntryFlags::BUSY)
                && entry.rw_idle();
            if !candidate {
                slot.unlock();
                continue;
            }
            if slot.flags.contains(EntryFlags::DIRTY) {
                // No reader or writer can start while we hold the slot lock
                // with the pin count at zero.
                let sector = slot.sector.unwrap();
                let data = unsafe { &*entry.data.get() };
                self.write_device(sector, data);
                slot.flags.remove(EntryFlags::DIRTY);
            }
            slot.sector = None;
            slot.flags = EntryFlags::VALID;
            entry.ident.store(RAW_NONE, Ordering::Relaxed);
            slot.unlock();
            return Some(i);
        }
        None
    }

    /// Locates or loads the entry for `sector`; returned pinned.
    fn get(this: &Arc<CacheInner>, sector: Sector) -> usize {
        if let Some(i) = this.pin_existing(sector) {
            return i;
        }
        Self::load(this, sector)
    }

    /// Brings `sector` into a claimed entry and fills it from the device,
    /// kicking off read-ahead of the successor sector.
    fn load(this: &Arc<CacheInner>, sector: Sector) -> usize {
        let assign = this.assign.lock();
        if let Some(i) = this.pin_existing(sector) {
            assign.unlock();
            return i;
        }
        let i = this.take_free(sector);
        assign.unlock();

        Self::spawn_read_ahead(this, sector + 1);

        // `take_free` left us holding the write side.
        let entry = &this.entries[i];
        let mut buf = [0u8; SECTOR_SIZE];
        this.read_device(sector, &mut buf);
        unsafe {
            *entry.data.get() = buf;
        }
        entry.writer_release();

        let mut slot = entry.slot.lock();
        slot.flags.remove(EntryFlags::BUSY);
        slot.unlock();
        i
    }

    /// Spawns the read-ahead helper for `target` and waits only for its
    /// slot-claim rendezvous. Best-effort: a failed spawn reads nothing
    /// ahead.
    fn spawn_read_ahead(this: &Arc<CacheInner>, target: Sector) {
        let sema = Arc::new(Semaphore::new(0));
        let claimed = Arc::clone(&sema);
        let inner = Arc::clone(this);
        let spawned = ThreadBuilder::new("read-ahead")
            .try_spawn(move || inner.read_ahead(target, claimed));
        if spawned.is_ok() {
            sema.wait();
        }
    }

    fn read_ahead(&self, target: Sector, claimed: Arc<Semaphore>) {
        if target.into_usize() >= self.disk.size() {
            claimed.signal();
            return;
        }
        if let Some(i) = self.pin_existing(target) {
            self.unpin(i);
            claimed.signal();
            return;
        }
        let assign = self.assign.lock();
        if let Some(i) = self.pin_existing(target) {
            assign.unlock();
            self.unpin(i);
            claimed.signal();
            return;
        }
        let i = self.take_free(target);
        assign.unlock();
        claimed.signal();

        // `take_free` left us holding the write side.
        let entry = &self.entries[i];
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_device(target, &mut buf);
        unsafe {
            *entry.data.get() = buf;
        }
        entry.writer_release();

        let mut slot = entry.slot.lock();
        slot.flags.remove(EntryFlags::BUSY);
        slot.pins -= 1;
        slot.unlock();
    }

    /// Writes every dirty buffer to the device, clearing DIRTY under a read
    /// lock so concurrent readers proceed and writers wait.
    fn write_behind(&self) {
        for entry in self.entries.iter() {
            let slot = entry.slot.lock();
            let dirty = slot.flags.contains(EntryFlags::DIRTY);
            slot.unlock();
            if !dirty {
                continue;
            }
            entry.reader_acquire();
            let slot = entry.slot.lock();
            let target = if slot.flags.contains(EntryFlags::DIRTY) {
                slot.sector
            } else {
                None
            };
            slot.unlock();
            if let Some(sector) = target {
                // The read lock excludes writers, so the buffer cannot
                // change or re-dirty under us.
                let data = unsafe { &*entry.data.get() };
                self.write_device(sector, data);
                let mut slot = entry.slot.lock();
                slot.flags.remove(EntryFlags::DIRTY);
                slot.unlock();
            }
            entry.reader_release();
        }
    }

    /// Unconditional flush: writes out every dirty buffer and releases each
    /// idle entry.
    fn flush(&self) {
        self.write_behind();
        for entry in self.entries.iter() {
            let mut slot = entry.slot.lock();
            if slot.sector.is_some()
                && slot.pins == 0
                && !slot.flags.contains(EntryFlags::BUSY)
                && entry.rw_idle()
            {
                if slot.flags.contains(EntryFlags::DIRTY) {
                    let sector = slot.sector.unwrap();
                    let data = unsafe { &*entry.data.get() };
                    self.write_device(sector, data);
                }
                slot.sector = None;
                slot.flags = EntryFlags::VALID;
                entry.ident.store(RAW_NONE, Ordering::Relaxed);
            }
            slot.unlock();
        }
    }
}

/// The buffer cache service. See the module docs.
pub struct Cache {
    inner: Arc<CacheInner>,
    flusher: SpinLock<Option<JoinHandle>>,
}

impl Cache {
    /// Builds the pool over `disk` and starts the background flusher.
    pub fn new(disk: Disk) -> Cache {
        let inner = Arc::new(CacheInner {
            disk,
            entries: (0..MAX_CACHE_SIZE).map(|_| Entry::new()).collect(),
            lru: SpinLock::new(LruList::new()),
            assign: SpinLock::new(()),
            stop: AtomicBool::new(false),
        });
        let sweeper = Arc::clone(&inner);
        let flusher = ThreadBuilder::new("cache-flusher").spawn(move || {
            let tick = core::time::Duration::from_millis(50);
            let mut since_sweep = core::time::Duration::ZERO;
            while !sweeper.stop.load(Ordering::Acquire) {
                std::thread::sleep(tick);
                since_sweep += tick;
                if since_sweep >= FLUSH_INTERVAL {
                    since_sweep = core::time::Duration::ZERO;
                    sweeper.write_behind();
                }
            }
        });
        Cache {
            inner,
            flusher: SpinLock::new(Some(flusher)),
        }
    }

    /// Copies the sector's current contents into `dst`.
    pub fn read(&self, sector: Sector, dst: &mut [u8; SECTOR_SIZE]) {
        let i = CacheInner::get(&self.inner, sector);
        let entry = &self.inner.entries[i];
        entry.reader_acquire();
        dst.copy_from_slice(unsafe { &*entry.data.get() });
        entry.reader_release();
        self.inner.unpin(i);
        self.inner.touch(i);
    }

    /// Replaces the sector's contents with `src`, dirtying the buffer.
    pub fn write(&self, sector: Sector, src: &[u8; SECTOR_SIZE]) {
        let i = CacheInner::get(&self.inner, sector);
        let entry = &self.inner.entries[i];
        entry.writer_acquire();
        unsafe {
            (*entry.data.get()).copy_from_slice(src);
        }
        let mut slot = entry.slot.lock();
        slot.flags.insert(EntryFlags::DIRTY);
        slot.unlock();
        entry.writer_release();
        self.inner.unpin(i);
        self.inner.touch(i);
    }

    /// Writes out every dirty buffer and drops the cached identities.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Stops the flusher and performs the final flush. Idempotent.
    pub fn shutdown(&self) {
        let mut guard = self.flusher.lock();
        let flusher = guard.take();
        guard.unlock();
        if let Some(flusher) = flusher {
            self.inner.stop.store(true, Ordering::Release);
            flusher.join();
            self.inner.flush();
        }
    }

    /// Whether `sector` currently sits in the pool. Probe for tests.
    pub fn contains(&self, sector: Sector) -> bool {
        let raw = sector.into_usize() as u32;
        self.inner
            .entries
            .iter()
            .any(|e| e.ident.load(Ordering::Relaxed) == raw)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspen::fs::MemDisk;

    fn pattern(tag: u8) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = tag ^ (i as u8);
        }
        buf
    }

    #[test]
    fn write_then_read_hits_the_cache() {
        let disk = Disk::new(MemDisk::new(256));
        let cache = Cache::new(disk.clone());
        cache.write(Sector(5), &pattern(0x11));
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(Sector(5), &mut out);
        assert_eq!(out, pattern(0x11));
        // Write-back is lazy; the device still holds zeroes.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(Sector(5), &mut raw).unwrap();
        assert_eq!(raw, [0u8; SECTOR_SIZE]);
        cache.flush();
        disk.read(Sector(5), &mut raw).unwrap();
        assert_eq!(raw, pattern(0x11));
    }

    #[test]
    fn saturating_the_pool_evicts_the_oldest() {
        let disk = Disk::new(MemDisk::new(4096));
        let cache = Cache::new(disk.clone());
        cache.write(Sector(7), &pattern(0x42));
        assert!(cache.contains(Sector(7)));
        // Touch more distinct sectors than the pool holds. Each miss may
        // also read ahead one sector; stride past that.
        for s in 0..MAX_CACHE_SIZE {
            let mut out = [0u8; SECTOR_SIZE];
            cache.read(Sector(100 + 2 * s), &mut out);
        }
        assert!(!cache.contains(Sector(7)));
        // Eviction wrote the dirty victim back.
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(Sector(7), &mut raw).unwrap();
        assert_eq!(raw, pattern(0x42));
    }

    #[test]
    fn read_ahead_pulls_in_the_successor() {
        let disk = Disk::new(MemDisk::new(64));
        let cache = Cache::new(disk);
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(Sector(10), &mut out);
        // The helper signals after claiming its slot; give its device read
        // a moment to land.
        for _ in 0..100 {
            if cache.contains(Sector(11)) {
                return;
            }
            std::thread::sleep(core::time::Duration::from_millis(5));
        }
        panic!("sector 11 never showed up in the cache");
    }

    #[test]
    fn last_sector_read_ahead_is_a_no_op() {
        let disk = Disk::new(MemDisk::new(16));
        let cache = Cache::new(disk);
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(Sector(15), &mut out);
        assert!(!cache.contains(Sector(16)));
    }

    #[test]
    fn concurrent_readers_see_whole_writes() {
        let disk = Disk::new(MemDisk::new(64));
        let cache = Arc::new(Cache::new(disk));
        cache.write(Sector(3), &pattern(0));
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for round in 0..200u8 {
                    cache.write(Sector(3), &[t.wrapping_mul(31).wrapping_add(round); SECTOR_SIZE]);
                    let mut out = [0u8; SECTOR_SIZE];
                    cache.read(Sector(3), &mut out);
                    // Every read observes some complete write, never a tear.
                    assert!(out.iter().all(|&b| b == out[0]));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn flusher_sweeps_dirty_buffers() {
        let disk = Disk::new(MemDisk::new(64));
        let cache = Cache::new(disk.clone());
        cache.write(Sector(9), &pattern(0x77));
        let deadline = std::time::Instant::now() + 3 * FLUSH_INTERVAL;
        loop {
            let mut raw = [0u8; SECTOR_SIZE];
            disk.read(Sector(9), &mut raw).unwrap();
            if raw == pattern(0x77) {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "flusher never wrote the dirty buffer back"
            );
            std::thread::sleep(core::time::Duration::from_millis(20));
        }
        // The sweep leaves the entry cached, unlike a full flush.
        assert!(cache.contains(Sector(9)));
    }
}
