//! Size-bounded device image cache shared by the server and the client.
//!
//! # How the cache works (for beginners)
//!
//! The cache is a fixed array of slots.  Each slot can hold the image of one
//! track or block, identified by a [`CacheKey`] of `(device, block)`.  A slot
//! is either *inactive* (free to be reused) or *active* (someone holds a
//! [`CacheHandle`] for it and may be reading or modifying its buffer).
//!
//! - A **hit** returns the existing slot, marked active.
//! - A **miss** claims the least-recently-used inactive slot, clears it, and
//!   returns it marked active so the caller can fill it.
//! - When every slot is active the caller waits until one is released, then
//!   scans again.  A wakeup is only a hint: the scan may find the freed slot
//!   already taken by somebody else, in which case the caller waits again.
//!
//! Releasing a handle (dropping it) marks the slot inactive but keeps its
//! contents cached until the slot is reused or purged.
//!
//! # Locking
//!
//! One cache-wide mutex guards the slot bookkeeping (keys, active flags, LRU
//! stamps).  Each slot's buffer has its own mutex which is only ever taken by
//! the current holder of the handle, so it is never contended.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, trace};

/// Identifies one cached track/block image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Cache-wide identity of the device the image belongs to.
    pub device: u32,
    /// Track (CKD) or block group (FBA) number.
    pub block: u32,
}

impl CacheKey {
    pub fn new(device: u32, block: u32) -> Self {
        Self { device, block }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Number of lookups that had to wait for a free slot.
    pub waits: u64,
    /// Number of entries dropped by purge requests.
    pub purged: u64,
}

#[derive(Debug, Default)]
struct SlotMeta {
    key: Option<CacheKey>,
    active: bool,
    /// LRU stamp: the cache clock value at the slot's last use.
    age: u64,
    /// Set when a purge hit the slot while it was active.
    purge_on_release: bool,
}

#[derive(Debug)]
struct CacheState {
    slots: Vec<SlotMeta>,
    clock: u64,
    stats: CacheStats,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<CacheState>,
    buffers: Vec<Mutex<Vec<u8>>>,
    freed: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outcome of a single non-blocking lookup attempt.
#[derive(Debug)]
pub enum TryLookup {
    /// The key was cached; the handle gives access to the cached image.
    Hit(CacheHandle),
    /// The key was not cached; an empty slot was claimed for it.
    Claimed(CacheHandle),
    /// No slot could be used right now (all active, or the key's slot is in use).
    Busy,
}

/// The shared cache.  Cloning is cheap and yields another handle to the same slots.
#[derive(Debug, Clone)]
pub struct Cache {
    shared: Arc<Shared>,
}

impl Cache {
    /// Creates a cache with `slots` entries (at least one).
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        let shared = Shared {
            state: Mutex::new(CacheState {
                slots: (0..slots).map(|_| SlotMeta::default()).collect(),
                clock: 0,
                stats: CacheStats::default(),
            }),
            buffers: (0..slots).map(|_| Mutex::new(Vec::new())).collect(),
            freed: Notify::new(),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.shared.buffers.len()
    }

    /// Makes one lookup attempt without waiting.
    pub fn try_lookup(&self, key: CacheKey) -> TryLookup {
        let mut state = self.shared.state();
        state.clock += 1;
        let now = state.clock;

        if let Some(index) = state.slots.iter().position(|s| s.key == Some(key)) {
            let slot = &mut state.slots[index];
            if slot.active {
                return TryLookup::Busy;
            }
            slot.active = true;
            slot.age = now;
            state.stats.hits += 1;
            trace!(?key, index, "cache hit");
            return TryLookup::Hit(self.handle(index, key));
        }

        let victim = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.active)
            .min_by_key(|(_, s)| (s.key.is_some(), s.age))
            .map(|(i, _)| i);

        match victim {
            Some(index) => {
                let slot = &mut state.slots[index];
                if let Some(old) = slot.key {
                    trace!(?old, ?key, index, "cache evict");
                }
                slot.key = Some(key);
                slot.active = true;
                slot.age = now;
                slot.purge_on_release = false;
                state.stats.misses += 1;
                drop(state);
                self.lock_buffer(index).clear();
                TryLookup::Claimed(self.handle(index, key))
            }
            None => TryLookup::Busy,
        }
    }

    /// Looks up `key`, claiming a free slot on a miss and waiting for one to
    /// be released when none is available.
    ///
    /// Returns the handle and `true` for a hit, `false` for a freshly claimed
    /// (empty) slot.
    pub async fn lookup(&self, key: CacheKey) -> (CacheHandle, bool) {
        let mut counted = false;
        loop {
            // Register interest before scanning so a release between the scan
            // and the await is not lost.
            let notified = self.shared.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_lookup(key) {
                TryLookup::Hit(handle) => return (handle, true),
                TryLookup::Claimed(handle) => return (handle, false),
                TryLookup::Busy => {}
            }

            if !counted {
                self.shared.state().stats.waits += 1;
                counted = true;
            }
            debug!(?key, "cache full; waiting for a slot to be released");
            notified.await;
        }
    }

    /// Returns `true` when `key` is cached (active or not).
    pub fn contains(&self, key: CacheKey) -> bool {
        self.shared
            .state()
            .slots
            .iter()
            .any(|s| s.key == Some(key) && !s.purge_on_release)
    }

    /// Drops every entry whose key matches `predicate`.
    ///
    /// Inactive entries are cleared immediately; active entries are cleared
    /// when their handle is released.  Returns the number of entries hit.
    pub fn purge_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        let mut state = self.shared.state();
        let mut count = 0;
        for slot in state.slots.iter_mut() {
            let Some(key) = slot.key else { continue };
            if !predicate(&key) {
                continue;
            }
            if slot.active {
                slot.purge_on_release = true;
            } else {
                slot.key = None;
                slot.age = 0;
            }
            count += 1;
        }
        state.stats.purged += count as u64;
        count
    }

    /// Drops every entry belonging to `device`.
    pub fn purge_device(&self, device: u32) -> usize {
        self.purge_where(|k| k.device == device)
    }

    /// Drops the listed blocks of `device`.
    pub fn purge_blocks(&self, device: u32, blocks: &[u32]) -> usize {
        self.purge_where(|k| k.device == device && blocks.contains(&k.block))
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.state().stats
    }

    fn handle(&self, index: usize, key: CacheKey) -> CacheHandle {
        CacheHandle {
            shared: Arc::clone(&self.shared),
            index,
            key,
            discard: false,
        }
    }

    fn lock_buffer(&self, index: usize) -> MutexGuard<'_, Vec<u8>> {
        self.shared.buffers[index]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive access to one active cache slot.  Dropping it releases the slot.
#[derive(Debug)]
pub struct CacheHandle {
    shared: Arc<Shared>,
    index: usize,
    key: CacheKey,
    discard: bool,
}

impl CacheHandle {
    /// The key this slot holds.
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Locks the image buffer for reading or writing.
    pub fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.shared.buffers[self.index]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the image buffer contents.
    pub fn fill(&self, data: &[u8]) {
        let mut buf = self.buffer();
        buf.clear();
        buf.extend_from_slice(data);
    }

    /// Releases the slot, keeping its contents cached.
    pub fn release(self) {}

    /// Releases the slot and forgets its contents (e.g. the fill failed).
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state();
            let slot = &mut state.slots[self.index];
            slot.active = false;
            if self.discard || slot.purge_on_release {
                slot.key = None;
                slot.age = 0;
                slot.purge_on_release = false;
            }
        }
        self.shared.freed.notify_waiters();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
