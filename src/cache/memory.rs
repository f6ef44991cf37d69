//! In-Process Store
//!
//! Concurrent map with a per-key expiry timer.
//!
//! # Design
//!
//! - DashMap shards give atomic set/delete/clear with respect to concurrent get
//! - Each write arms a tokio timer tagged with the write's generation; a
//!   rewrite aborts the previous timer before installing its own
//! - `clear` aborts every timer while wiping the map so no timer fires afterwards
//! - Lookups also check expiry lazily, so a late timer never serves stale data

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::entry::CacheEntry;
use super::store::{Store, StoreCounters, StoreStats};
use crate::error::Result;

struct Slot {
    entry: CacheEntry,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct MemoryInner {
    entries: DashMap<String, Slot>,
    counters: StoreCounters,
    generation: AtomicU64,
}

impl MemoryInner {
    fn remove_generation(&self, key: &str, generation: u64) -> bool {
        match self
            .entries
            .remove_if(key, |_, slot| slot.entry.generation() == generation)
        {
            Some((_, mut slot)) => {
                slot.cancel_timer();
                true
            }
            None => false,
        }
    }
}

/// In-process key-value store with TTL
#[derive(Clone)]
pub struct InProcessStore {
    name: String,
    inner: Arc<MemoryInner>,
}

impl InProcessStore {
    /// Create an empty store named `memory`
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create an empty store with a custom name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(MemoryInner {
                entries: DashMap::new(),
                counters: StoreCounters::new(),
                generation: AtomicU64::new(1),
            }),
        }
    }

    /// Number of entries, including any expired entries not yet reaped
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Keys currently held
    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of armed expiry timers
    pub fn pending_timers(&self) -> usize {
        self.inner
            .entries
            .iter()
            .filter(|e| e.value().timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    fn arm_timer(&self, key: &str, ttl: Duration, generation: u64) -> Option<JoinHandle<()>> {
        if ttl.is_zero() {
            return None;
        }

        let weak: Weak<MemoryInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                // Only reap the write that armed this timer
                if inner
                    .entries
                    .remove_if(&key, |_, slot| slot.entry.generation() == generation)
                    .is_some()
                {
                    tracing::trace!(key = %key, "Expired cache entry");
                }
            }
        }))
    }
}

impl Default for InProcessStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InProcessStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let lookup = self
            .inner
            .entries
            .get(key)
            .map(|slot| (slot.entry.is_expired(), slot.entry.generation(), slot.entry.data().clone()));

        let result = match lookup {
            Some((false, _, data)) => Some(data),
            Some((true, generation, _)) => {
                self.inner.remove_generation(key, generation);
                None
            }
            None => None,
        };

        self.inner.counters.record_lookup(&result);
        Ok(result)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.arm_timer(key, ttl, generation);
        let slot = Slot {
            entry: CacheEntry::new(value, ttl, generation),
            timer,
        };

        if let Some(mut previous) = self.inner.entries.insert(key.to_string(), slot) {
            previous.cancel_timer();
        }

        self.inner.counters.record_set();
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.counters.record_delete();
        match self.inner.entries.remove(key) {
            Some((_, mut slot)) => {
                slot.cancel_timer();
                Ok(!slot.entry.is_expired())
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<bool> {
        self.inner.entries.retain(|_, slot| {
            slot.cancel_timer();
            false
        });
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .inner
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired()))
    }

    fn stats(&self) -> StoreStats {
        self.inner
            .counters
            .snapshot(&self.name, self.inner.entries.len() as u64)
    }
}

impl std::fmt::Debug for InProcessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessStore")
            .field("name", &self.name)
            .field("entries", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
