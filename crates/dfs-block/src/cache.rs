//! Block buffer cache.
//!
//! A fixed pool of `capacity` sector buffers fronts every device registered
//! with the cache. [`BufCache::acquire`] hands out at most one [`BlockGuard`]
//! per `(device, block)` pair at a time; a second acquirer blocks until the
//! holder drops its guard. Lookups are hash-indexed; on a miss the least
//! recently used clean, unheld entry is rebound to the new block.
//!
//! Two invariants the layers above lean on:
//!
//! * Dirty entries are never evicted. A block stays pinned from the moment
//!   [`BlockGuard::mark_dirty`] runs until the transaction log calls
//!   [`BufCache::clear_dirty`] after commit.
//! * `mark_dirty` is write-through: the buffer reaches the device before the
//!   call returns, so the cache never holds the only copy of marked bytes.
//!
//! When a miss finds every entry held or dirty, the acquirer waits for a
//! release if at least one entry is held. If all entries are released but
//! dirty, no release is coming and acquire fails with
//! [`DfsError::PoolExhausted`].

use crate::{BlockData, ByteDevice};
use dfs_error::{DfsError, Result};
use dfs_types::{BlockNumber, DeviceId, SECTOR_SIZE};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default pool size. Sized so one maximal transaction plus directory and
/// inode table traffic fits without contention.
pub const DEFAULT_CAPACITY: usize = 30;

/// Hit, miss, and contention counters since cache creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub waits: u64,
}

struct Entry {
    key: Option<(DeviceId, BlockNumber)>,
    busy: bool,
    dirty: bool,
    valid: bool,
    /// Buffer for the cached bytes; `None` exactly while a guard holds it.
    content: Option<Box<BlockData>>,
    last_used: u64,
}

struct CacheState {
    entries: Vec<Entry>,
    index: HashMap<(DeviceId, BlockNumber), usize>,
    tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Fixed-pool, hash-indexed buffer cache with per-block exclusive guards.
pub struct BufCache {
    devices: RwLock<HashMap<DeviceId, Arc<dyn ByteDevice>>>,
    state: Mutex<CacheState>,
    /// Signalled on every guard release and on `clear_dirty`.
    available: Condvar,
    capacity: usize,
}

impl BufCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| Entry {
                key: None,
                busy: false,
                dirty: false,
                valid: false,
                content: Some(Box::new([0; SECTOR_SIZE])),
                last_used: 0,
            })
            .collect();
        info!(target: "dfs::cache", capacity, "block cache created");
        Self {
            devices: RwLock::new(HashMap::new()),
            state: Mutex::new(CacheState {
                entries,
                index: HashMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Make a device visible to the cache under `id`.
    pub fn register(&self, id: DeviceId, device: Arc<dyn ByteDevice>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&id) {
            return Err(DfsError::ContractViolation(format!(
                "device {id} already registered"
            )));
        }
        devices.insert(id, device);
        Ok(())
    }

    /// Handle to a registered device, for raw access outside the cache.
    pub fn device(&self, id: DeviceId) -> Result<Arc<dyn ByteDevice>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| DfsError::ContractViolation(format!("device {id} not registered")))
    }

    /// Exclusive access to one block, reading it from the device on a miss.
    ///
    /// Blocks while another guard holds the same block, and while the pool
    /// is full of held entries. A thread must not acquire a block it already
    /// holds; that waits on itself forever.
    pub fn acquire(&self, dev: DeviceId, block: BlockNumber) -> Result<BlockGuard<'_>> {
        let device = self.device(dev)?;
        let offset = block
            .byte_offset()
            .ok_or_else(|| DfsError::Format(format!("block {block} byte offset overflows")))?;

        let mut state = self.state.lock();
        let (slot, mut content, valid) = loop {
            match state.index.get(&(dev, block)).copied() {
                Some(slot) if state.entries[slot].busy => {
                    state.stats.waits += 1;
                    self.available.wait(&mut state);
                }
                Some(slot) => {
                    state.stats.hits += 1;
                    let tick = state.next_tick();
                    let entry = &mut state.entries[slot];
                    entry.busy = true;
                    entry.last_used = tick;
                    let valid = entry.valid;
                    let Some(content) = entry.content.take() else {
                        return Err(DfsError::ContractViolation(
                            "cache entry released without content".to_owned(),
                        ));
                    };
                    break (slot, content, valid);
                }
                None => {
                    if let Some(slot) = pick_victim(&state.entries) {
                        state.stats.misses += 1;
                        if state.entries[slot].valid {
                            state.stats.evictions += 1;
                        }
                        let tick = state.next_tick();
                        if let Some(old) = state.entries[slot].key.take() {
                            state.index.remove(&old);
                            debug!(
                                target: "dfs::cache",
                                device = %dev,
                                block = %block,
                                old_block = %old.1,
                                slot,
                                "rebound cache entry"
                            );
                        }
                        state.index.insert((dev, block), slot);
                        let entry = &mut state.entries[slot];
                        entry.key = Some((dev, block));
                        entry.busy = true;
                        entry.dirty = false;
                        entry.valid = false;
                        entry.last_used = tick;
                        let Some(content) = entry.content.take() else {
                            return Err(DfsError::ContractViolation(
                                "cache entry released without content".to_owned(),
                            ));
                        };
                        break (slot, content, false);
                    } else if state.entries.iter().any(|entry| entry.busy) {
                        state.stats.waits += 1;
                        self.available.wait(&mut state);
                    } else {
                        return Err(DfsError::PoolExhausted {
                            capacity: self.capacity,
                        });
                    }
                }
            }
        };
        drop(state);

        if !valid {
            if let Err(err) = device.read_at(offset, &mut content[..]) {
                self.restore_after_failed_read(slot, content);
                return Err(err);
            }
        }

        Ok(BlockGuard {
            cache: self,
            device,
            dev,
            block,
            offset,
            slot,
            content: Some(content),
            modified: false,
        })
    }

    /// Unpin a block once the transaction that dirtied it has committed.
    pub fn clear_dirty(&self, dev: DeviceId, block: BlockNumber) -> Result<()> {
        let mut state = self.state.lock();
        let Some(&slot) = state.index.get(&(dev, block)) else {
            return Err(DfsError::ContractViolation(format!(
                "clear_dirty on uncached block {block} of device {dev}"
            )));
        };
        state.entries[slot].dirty = false;
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Whether `(dev, block)` is currently bound to a cache entry.
    #[must_use]
    pub fn contains(&self, dev: DeviceId, block: BlockNumber) -> bool {
        self.state.lock().index.contains_key(&(dev, block))
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn restore_after_failed_read(&self, slot: usize, content: Box<BlockData>) {
        let mut state = self.state.lock();
        if let Some(key) = state.entries[slot].key.take() {
            state.index.remove(&key);
        }
        let entry = &mut state.entries[slot];
        entry.busy = false;
        entry.dirty = false;
        entry.valid = false;
        entry.content = Some(content);
        drop(state);
        self.available.notify_all();
    }
}

impl fmt::Debug for BufCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

fn pick_victim(entries: &[Entry]) -> Option<usize> {
    let mut best: Option<(u64, usize)> = None;
    for (slot, entry) in entries.iter().enumerate() {
        if entry.busy || entry.dirty {
            continue;
        }
        if entry.key.is_none() {
            return Some(slot);
        }
        if best.map_or(true, |(used, _)| entry.last_used < used) {
            best = Some((entry.last_used, slot));
        }
    }
    best.map(|(_, slot)| slot)
}

/// Exclusive ownership of one cached block.
///
/// Dropping the guard releases the block back to the pool and wakes waiting
/// acquirers. Modifications must be flushed with [`BlockGuard::mark_dirty`];
/// a guard dropped with unflushed modifications discards them and the entry
/// is invalidated.
#[must_use = "dropping the guard releases the block"]
pub struct BlockGuard<'a> {
    cache: &'a BufCache,
    device: Arc<dyn ByteDevice>,
    dev: DeviceId,
    block: BlockNumber,
    offset: u64,
    slot: usize,
    content: Option<Box<BlockData>>,
    modified: bool,
}

impl BlockGuard<'_> {
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.dev
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    #[must_use]
    pub fn data(&self) -> &BlockData {
        self.content.as_deref().expect("content held until drop")
    }

    pub fn data_mut(&mut self) -> &mut BlockData {
        self.modified = true;
        self.content
            .as_deref_mut()
            .expect("content held until drop")
    }

    /// Write the buffer through to the device and pin the entry dirty.
    pub fn mark_dirty(&mut self) -> Result<()> {
        self.device.write_at(self.offset, &self.data()[..])?;
        let mut state = self.cache.state.lock();
        state.entries[self.slot].dirty = true;
        drop(state);
        self.modified = false;
        Ok(())
    }
}

impl fmt::Debug for BlockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockGuard")
            .field("device", &self.dev)
            .field("block", &self.block)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        let Some(content) = self.content.take() else {
            return;
        };
        let discarded = self.modified;
        let mut state = self.cache.state.lock();
        let tick = state.next_tick();
        let entry = &mut state.entries[self.slot];
        entry.busy = false;
        entry.last_used = tick;
        entry.valid = !discarded;
        entry.content = Some(content);
        drop(state);
        if discarded {
            warn!(
                target: "dfs::cache",
                device = %self.dev,
                block = %self.block,
                "guard dropped with unflushed modifications; buffer discarded"
            );
        }
        self.cache.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemByteDevice;

    fn cache_over_mem(capacity: usize, blocks: usize) -> (BufCache, Arc<MemByteDevice>) {
        let cache = BufCache::new(capacity);
        let dev = Arc::new(MemByteDevice::new(blocks * SECTOR_SIZE));
        cache
            .register(DeviceId(0), Arc::clone(&dev) as Arc<dyn ByteDevice>)
            .expect("register");
        (cache, dev)
    }

    #[test]
    fn acquire_reads_through_device() {
        let (cache, dev) = cache_over_mem(4, 8);
        dev.write_at(2 * SECTOR_SIZE as u64, &[0x42; SECTOR_SIZE])
            .expect("seed");

        let guard = cache.acquire(DeviceId(0), BlockNumber(2)).expect("acquire");
        assert_eq!(guard.data()[0], 0x42);
        assert_eq!(guard.block(), BlockNumber(2));
        drop(guard);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);

        let guard = cache.acquire(DeviceId(0), BlockNumber(2)).expect("hit");
        assert_eq!(guard.data()[0], 0x42);
        drop(guard);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn mark_dirty_writes_through() {
        let (cache, dev) = cache_over_mem(4, 8);

        let mut guard = cache.acquire(DeviceId(0), BlockNumber(1)).expect("acquire");
        guard.data_mut()[0] = 0x99;
        guard.mark_dirty().expect("mark dirty");
        // Device already has the bytes while the guard is still held.
        assert_eq!(dev.snapshot()[SECTOR_SIZE], 0x99);
        drop(guard);
        assert_eq!(dev.snapshot()[SECTOR_SIZE], 0x99);
    }

    #[test]
    fn rebind_evicts_least_recently_used() {
        let (cache, _dev) = cache_over_mem(2, 8);

        drop(cache.acquire(DeviceId(0), BlockNumber(0)).expect("b0"));
        drop(cache.acquire(DeviceId(0), BlockNumber(1)).expect("b1"));
        // Touch 0 so 1 becomes the LRU entry.
        drop(cache.acquire(DeviceId(0), BlockNumber(0)).expect("b0 again"));
        drop(cache.acquire(DeviceId(0), BlockNumber(2)).expect("b2"));

        assert!(cache.contains(DeviceId(0), BlockNumber(0)));
        assert!(!cache.contains(DeviceId(0), BlockNumber(1)));
        assert!(cache.contains(DeviceId(0), BlockNumber(2)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn dirty_entries_are_never_evicted() {
        let (cache, _dev) = cache_over_mem(2, 8);

        let mut guard = cache.acquire(DeviceId(0), BlockNumber(0)).expect("b0");
        guard.data_mut()[7] = 7;
        guard.mark_dirty().expect("dirty");
        drop(guard);

        drop(cache.acquire(DeviceId(0), BlockNumber(1)).expect("b1"));
        drop(cache.acquire(DeviceId(0), BlockNumber(2)).expect("b2"));

        // The dirty block outlived both rebinds.
        assert!(cache.contains(DeviceId(0), BlockNumber(0)));
        assert!(!cache.contains(DeviceId(0), BlockNumber(1)));
    }

    #[test]
    fn all_dirty_pool_is_exhausted() {
        let (cache, _dev) = cache_over_mem(2, 8);

        for block in 0..2 {
            let mut guard = cache
                .acquire(DeviceId(0), BlockNumber(block))
                .expect("acquire");
            guard.data_mut()[0] = 1;
            guard.mark_dirty().expect("dirty");
        }

        let err = cache.acquire(DeviceId(0), BlockNumber(5)).unwrap_err();
        assert!(matches!(err, DfsError::PoolExhausted { capacity: 2 }));
    }

    #[test]
    fn clear_dirty_unpins_entry() {
        let (cache, _dev) = cache_over_mem(2, 8);

        for block in 0..2 {
            let mut guard = cache
                .acquire(DeviceId(0), BlockNumber(block))
                .expect("acquire");
            guard.data_mut()[0] = 1;
            guard.mark_dirty().expect("dirty");
        }
        cache.clear_dirty(DeviceId(0), BlockNumber(0)).expect("clear");

        let guard = cache.acquire(DeviceId(0), BlockNumber(5)).expect("acquire");
        drop(guard);
        assert!(!cache.contains(DeviceId(0), BlockNumber(0)));
        assert!(cache.contains(DeviceId(0), BlockNumber(1)));
    }

    #[test]
    fn clear_dirty_on_uncached_block_is_a_contract_violation() {
        let (cache, _dev) = cache_over_mem(2, 8);
        let err = cache.clear_dirty(DeviceId(0), BlockNumber(3)).unwrap_err();
        assert!(matches!(err, DfsError::ContractViolation(_)));
    }

    #[test]
    fn unflushed_modifications_are_discarded() {
        let (cache, dev) = cache_over_mem(4, 8);

        let mut guard = cache.acquire(DeviceId(0), BlockNumber(3)).expect("acquire");
        guard.data_mut()[0] = 0xEE;
        drop(guard);

        // Nothing reached the device, and the next acquire re-reads it.
        assert_eq!(dev.snapshot()[3 * SECTOR_SIZE], 0);
        let guard = cache.acquire(DeviceId(0), BlockNumber(3)).expect("reread");
        assert_eq!(guard.data()[0], 0);
    }

    #[test]
    fn blocked_acquirer_sees_flushed_handoff() {
        let (cache, _dev) = cache_over_mem(4, 8);
        let cache = Arc::new(cache);

        let mut guard = cache.acquire(DeviceId(0), BlockNumber(6)).expect("hold");
        guard.data_mut()[0] = 0x77;
        guard.mark_dirty().expect("dirty");

        let worker = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let guard = cache
                    .acquire(DeviceId(0), BlockNumber(6))
                    .expect("second acquire");
                guard.data()[0]
            })
        };

        drop(guard);
        assert_eq!(worker.join().expect("no panic"), 0x77);
    }

    #[test]
    fn unregistered_device_is_rejected() {
        let cache = BufCache::new(2);
        let err = cache.acquire(DeviceId(9), BlockNumber(0)).unwrap_err();
        assert!(matches!(err, DfsError::ContractViolation(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (cache, dev) = cache_over_mem(2, 4);
        let err = cache
            .register(DeviceId(0), dev as Arc<dyn ByteDevice>)
            .unwrap_err();
        assert!(matches!(err, DfsError::ContractViolation(_)));
    }

    #[test]
    fn cache_serves_two_devices() {
        let cache = BufCache::new(4);
        let dev_a = Arc::new(MemByteDevice::new(4 * SECTOR_SIZE));
        let dev_b = Arc::new(MemByteDevice::new(4 * SECTOR_SIZE));
        dev_a.write_at(0, &[0xAA; SECTOR_SIZE]).expect("seed a");
        dev_b.write_at(0, &[0xBB; SECTOR_SIZE]).expect("seed b");
        cache
            .register(DeviceId(0), dev_a as Arc<dyn ByteDevice>)
            .expect("register a");
        cache
            .register(DeviceId(1), dev_b as Arc<dyn ByteDevice>)
            .expect("register b");

        let a = cache.acquire(DeviceId(0), BlockNumber(0)).expect("a");
        let b = cache.acquire(DeviceId(1), BlockNumber(0)).expect("b");
        assert_eq!(a.data()[0], 0xAA);
        assert_eq!(b.data()[0], 0xBB);
    }
}
