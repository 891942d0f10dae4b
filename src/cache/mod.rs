//! In-memory caches with explicit TTL semantics.
//!
//! Two shapes cover every cache in the crate:
//!
//! - [`TtlCache`]: concurrent keyed cache over DashMap, O(1) get/insert,
//!   per-entry expiry, hit/miss counters. Keys are case-folded on every
//!   access so `Urn:X` and `urn:x` share a slot.
//! - [`Snapshot`]: a single-slot "latest value with TTL" holder for caches
//!   keyed by a constant (the provider registry). The owning component
//!   serializes refreshes by keeping it behind a `tokio::sync::Mutex`,
//!   which also coalesces concurrent loads into one upstream call.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent keyed TTL cache with case-folded keys
pub struct TtlCache<V> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a live value. Expired entries are removed and count as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let key = key.to_lowercase();
        if let Some(entry) = self.entries.get(&key) {
            if Instant::now() < entry.expires_at {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a value, replacing any previous entry wholesale
    pub fn insert(&self, key: &str, value: V) {
        let entry = Entry { value, expires_at: Instant::now() + self.ttl };
        self.entries.insert(key.to_lowercase(), entry);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop expired entries. Callers may run this opportunistically;
    /// correctness never depends on it since `get` checks expiry.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired cache entries");
        }
        evicted
    }
}

/// Single-slot snapshot with TTL and last-known-good fallback
pub struct Snapshot<V> {
    value: Option<(V, Instant)>,
    ttl: Duration,
}

impl<V: Clone> Snapshot<V> {
    pub fn new(ttl: Duration) -> Self {
        Self { value: None, ttl }
    }

    /// The current value, only while within TTL
    pub fn fresh(&self) -> Option<V> {
        self.value.as_ref().and_then(|(value, stored_at)| {
            if stored_at.elapsed() < self.ttl {
                Some(value.clone())
            } else {
                None
            }
        })
    }

    /// The last stored value regardless of age, for stale fallback
    pub fn last_known(&self) -> Option<V> {
        self.value.as_ref().map(|(value, _)| value.clone())
    }

    /// Replace the slot wholesale and restart its TTL
    pub fn replace(&mut self, value: V) {
        self.value = Some((value, Instant::now()));
    }
}
