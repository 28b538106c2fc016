//! DNS response cache with TTL-based expiration.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::dns::CacheKey;

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when [`ManualClock::advance`] is called.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct CacheEntry {
    response: Vec<u8>,
    inserted_at: Instant,
}

#[derive(Default)]
struct Store {
    entries: FxHashMap<CacheKey, CacheEntry>,
    /// Insertion order, only kept when the cache is bounded. A record whose
    /// key has since been removed or restamped is stale and skipped.
    order: VecDeque<(CacheKey, Instant)>,
}

impl Store {
    fn is_current(&self, key: &CacheKey, stamp: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.inserted_at == stamp)
    }

    fn record(&mut self, key: &CacheKey, stamp: Instant) {
        self.order.push_back((key.clone(), stamp));

        if self.order.len() > 2 * self.entries.len() + 16 {
            let entries = &self.entries;
            self.order.retain(|(key, stamp)| {
                entries
                    .get(key)
                    .is_some_and(|entry| entry.inserted_at == *stamp)
            });
        }
    }
}

/// TTL-based DNS response cache.
///
/// One mutex guards the map; `get` holds it across the read, the age check
/// and the eviction of a stale entry, `put` across the write. Stale entries
/// are only removed when read (or when room is needed for a new key), there
/// is no background sweep.
pub struct DnsCache {
    store: Mutex<Store>,
    ttl: Duration,
    max_entries: Option<NonZeroUsize>,
    clock: Arc<dyn Clock>,
}

impl DnsCache {
    /// Unbounded cache on the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            ttl,
            max_entries: None,
            clock,
        }
    }

    /// Cap the number of entries. Zero means unbounded.
    ///
    /// When a new key arrives at capacity, expired entries are purged first
    /// and, failing that, the oldest insertion is evicted.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = NonZeroUsize::new(max_entries);
        self
    }

    /// Look up a fresh response. A stale entry is removed and reported as a
    /// miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut store = self.lock();

        let entry = store.entries.get(key)?;
        if self.is_fresh(entry, now) {
            return Some(entry.response.clone());
        }

        store.entries.remove(key);
        None
    }

    /// Insert or overwrite the response for `key`, stamped with the current
    /// time. Last writer wins.
    pub fn put(&self, key: &CacheKey, response: &[u8]) {
        let mut guard = self.lock();
        let store = &mut *guard;
        // Read under the lock so insertion order follows the stamps.
        let now = self.clock.now();
        let bounded = self.max_entries.is_some();

        if let Some(entry) = store.entries.get_mut(key) {
            entry.response.clear();
            entry.response.extend_from_slice(response);
            let restamped = entry.inserted_at != now;
            entry.inserted_at = now;
            if bounded && restamped {
                store.record(key, now);
            }
            return;
        }

        if let Some(max) = self.max_entries {
            if store.entries.len() >= max.get() {
                self.make_room(store, max.get(), now);
            }
        }

        store.entries.insert(
            key.clone(),
            CacheEntry {
                response: response.to_vec(),
                inserted_at: now,
            },
        );
        if bounded {
            store.record(key, now);
        }
    }

    /// Number of stored entries, including stale ones not yet read.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) < self.ttl
    }

    // Every entry shares one TTL, so the expired entries are exactly the
    // oldest insertions and sit at the front of the order queue.
    fn make_room(&self, store: &mut Store, max: usize, now: Instant) {
        while let Some((key, stamp)) = store.order.pop_front() {
            if !store.is_current(&key, stamp) {
                continue;
            }

            let fresh = store
                .entries
                .get(&key)
                .is_some_and(|entry| self.is_fresh(entry, now));
            if fresh && store.entries.len() < max {
                store.order.push_front((key, stamp));
                return;
            }

            store.entries.remove(&key);
            if fresh {
                return;
            }
        }
    }

    // Entries are replaced whole under the lock, so a poisoned map is still
    // consistent.
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}
