//! Byte-budgeted frame cache.
//!
//! Holds payloads returned by the worker (decoded frames, metadata records)
//! so that repeated identical requests never reach the worker process.
//!
//! # Design
//!
//! - Keyed by [`CacheKey`] (source, logical offset, command type, params hash)
//! - Least-recently-used eviction once the byte budget is exceeded
//! - A `None` budget disables eviction entirely
//! - A single entry larger than the whole budget is still stored; the cache
//!   then exceeds its budget by that one entry until the next `store`

mod key;

pub use key::{fingerprint, CacheKey};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tracing::debug;

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    payload: Bytes,
    size_bytes: u64,
    last_access_sequence: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// `last_access_sequence` -> key, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    total_bytes: u64,
    next_sequence: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn touch(&mut self, key: &CacheKey) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.recency.insert(sequence, key.clone());
        sequence
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access_sequence);
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn evict_until(&mut self, limit: u64) {
        while self.total_bytes > limit {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_bytes -= entry.size_bytes;
                self.stats.evictions += 1;
                debug!(
                    source = key.source(),
                    command = %key.command(),
                    bytes = entry.size_bytes,
                    "evicted frame cache entry"
                );
            }
        }
    }
}

/// Byte-budgeted LRU store of worker payloads.
///
/// Safe to share between tasks behind an `Arc`. A single lock guards every
/// key: the budget and recency order are global, so eviction must see the
/// whole cache at once. Critical sections never await or do I/O.
#[derive(Debug)]
pub struct FrameCache {
    budget: Option<u64>,
    inner: Mutex<CacheInner>,
}

impl FrameCache {
    /// Create a cache with the given byte budget (`None` = no limit).
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            budget,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Create a cache that never evicts.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn budget(&self) -> Option<u64> {
        self.budget
    }

    /// Look up a payload, marking it most recently used on a hit.
    pub fn lookup(&self, key: &CacheKey) -> Option<Bytes> {
        let mut inner = self.lock();
        let Some(previous) = inner.entries.get(key).map(|e| e.last_access_sequence) else {
            inner.stats.misses += 1;
            return None;
        };

        inner.recency.remove(&previous);
        let sequence = inner.touch(key);
        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.last_access_sequence = sequence;
        Some(entry.payload.clone())
    }

    /// Whether a key is present, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Store a payload, evicting least-recently-used entries to fit the budget.
    pub fn store(&self, key: CacheKey, payload: Bytes) {
        let size_bytes = payload.len() as u64;
        let mut inner = self.lock();
        inner.remove(&key);

        if let Some(budget) = self.budget {
            inner.evict_until(budget.saturating_sub(size_bytes));
        }

        let last_access_sequence = inner.touch(&key);
        inner.total_bytes += size_bytes;
        inner.stats.insertions += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                payload,
                size_bytes,
                last_access_sequence,
            },
        );
    }

    /// Drop a single entry.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Evict least-recently-used entries until at most `bytes` remain.
    pub fn shrink_to(&self, bytes: u64) {
        self.lock().evict_until(bytes);
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.total_bytes = 0;
    }

    /// Sum of the sizes of all live entries.
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::unbounded()
    }
}
