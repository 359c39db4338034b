//! Last-writer-wins conflict cache.
//!
//! A capacity-bounded LRU map from record key to the timestamp of the most
//! recent locally-applied write to that key. The local write path inserts;
//! the sending loops only read, using the cached timestamp to decide whether
//! a change-log record is still the freshest known value for its key.
//!
//! # Consistency Tolerance
//!
//! A lookup is not atomic with concurrent inserts from the write path: a
//! sender may forward or drop a record based on a momentarily stale
//! timestamp. The receiving node applies the same freshness check on its own
//! cache, so the outcome self-corrects. A key evicted under capacity pressure
//! reads as a miss, and a miss always drops the record (freshness cannot be
//! established, so fail safe by not forwarding).

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Default capacity, matching the local write path's working set.
pub const DEFAULT_CONFLICT_CACHE_CAPACITY: usize = 1 << 20;

/// Shared key → exec_time cache with internal synchronization.
pub struct ConflictCache {
    entries: Mutex<LruCache<String, i64>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ConflictCache {
    /// Create a cache bounded to `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity).unwrap_or_else(|| NonZeroUsize::new(1).unwrap());
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Timestamp of the most recent locally-applied write to `key`, or `None`
    /// on a miss. Touches the entry's recency. A poisoned lock reads as a
    /// miss, which downstream treats as "do not forward".
    pub fn exec_time(&self, key: &str) -> Option<i64> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(&t) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(t)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a locally-applied write. Called by the local write path; the
    /// relay core itself never inserts.
    pub fn insert(&self, key: impl Into<String>, exec_time: i64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key.into(), exec_time);
        }
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since construction.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
