//! Store Backend Contract
//!
//! Every cache backend (in-process map, distributed store, and the
//! compression / partitioning decorators around them) implements [`Store`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::error::Result;

/// Key-value backend with per-entry TTL
///
/// A `ttl` of [`Duration::ZERO`] stores the value without expiry.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name used in logs, stats and errors
    fn name(&self) -> &str;

    /// Get a value, `None` on miss or after expiry
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool>;

    /// Remove a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every value
    async fn clear(&self) -> Result<bool>;

    /// Check whether a live value exists
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Backend statistics
    fn stats(&self) -> StoreStats;

    /// Connectivity probe; local backends are always healthy
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    /// Backend name
    pub backend: String,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Live entries (best effort for remote backends)
    pub entries: u64,
    /// Set operations
    pub sets: u64,
    /// Delete operations
    pub deletes: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

impl StoreStats {
    /// Combine stats of several backends under a new name
    pub fn merged(backend: impl Into<String>, parts: &[StoreStats]) -> Self {
        let mut merged = StoreStats {
            backend: backend.into(),
            ..Default::default()
        };
        for part in parts {
            merged.hits += part.hits;
            merged.misses += part.misses;
            merged.entries += part.entries;
            merged.sets += part.sets;
            merged.deletes += part.deletes;
        }
        merged.hit_ratio = hit_ratio(merged.hits, merged.misses);
        merged
    }
}

fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Lock-free operation counters shared by store implementations
#[derive(Debug, Default)]
pub struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl StoreCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lookup result
    pub fn record_lookup<T>(&self, result: &Option<T>) {
        if result.is_some() {
            self.record_hit();
        } else {
            self.record_miss();
        }
    }

    /// Snapshot into [`StoreStats`]
    pub fn snapshot(&self, backend: &str, entries: u64) -> StoreStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        StoreStats {
            backend: backend.to_string(),
            hits,
            misses,
            entries,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hit_ratio: hit_ratio(hits, misses),
        }
    }
}
