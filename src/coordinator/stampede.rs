//! Stampede Protection
//!
//! At most one in-flight loader per key. The lock entry is inserted before the
//! load starts and removed by a guard when it finishes, fails, panics or is
//! cancelled. Other callers poll until the lock disappears or their wait
//! times out; on timeout they load directly rather than fail.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{bump, AdvancedCache};
use crate::error::Error;

/// Per-key load locks
#[derive(Debug)]
pub struct LockRegistry {
    locks: DashMap<String, LockInfo>,
    next_id: AtomicU64,
    poll_interval: Duration,
}

#[derive(Debug, Clone, Copy)]
struct LockInfo {
    id: u64,
    acquired_at: Instant,
}

/// Result of waiting on another caller's lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The holder released the lock
    Released,
    /// The wait exceeded its bound
    TimedOut,
}

impl LockRegistry {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            next_id: AtomicU64::new(1),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Take the lock for `key` if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard<'_>> {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                slot.insert(LockInfo {
                    id,
                    acquired_at: Instant::now(),
                });
                Some(LockGuard {
                    registry: self,
                    key: key.to_string(),
                    id,
                })
            }
        }
    }

    /// Whether a load for `key` is in flight
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    /// How long the current holder has held `key`
    pub fn held_for(&self, key: &str) -> Option<Duration> {
        self.locks.get(key).map(|info| info.acquired_at.elapsed())
    }

    /// Poll until `key` is released or `timeout` elapses
    pub async fn wait_for_release(&self, key: &str, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_locked(key) {
                return WaitOutcome::Released;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Number of held locks
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Releases its lock on drop
pub struct LockGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
    id: u64,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .locks
            .remove_if(&self.key, |_, info| info.id == self.id);
    }
}

impl fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl AdvancedCache {
    /// Cache-aside read with per-key stampede protection
    ///
    /// On a miss the first caller runs `loader` and caches its value for
    /// `ttl`; concurrent callers wait up to `lock_timeout` and are then
    /// served from cache. A waiter whose wait times out runs its own loader.
    pub async fn cache_aside_with_lock<V, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        lock_timeout: Duration,
        loader: F,
    ) -> Result<V, E>
    where
        V: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let inner = &self.inner;
        if let Some(value) = inner.manager.get::<V>(key).await {
            return Ok(value);
        }

        let guard = loop {
            if let Some(guard) = inner.locks.try_acquire(key) {
                // Another holder may have filled the cache between our miss and acquiring
                if let Some(value) = inner.manager.get::<V>(key).await {
                    return Ok(value);
                }
                break Some(guard);
            }

            match inner.locks.wait_for_release(key, lock_timeout).await {
                WaitOutcome::Released => {
                    if let Some(value) = inner.manager.get::<V>(key).await {
                        bump(&inner.counters.stampede_prevented);
                        if let Some(metrics) = &inner.metrics {
                            metrics.inc_stampede_prevented();
                        }
                        debug!(key, "Served waiter from cache after concurrent load");
                        return Ok(value);
                    }
                    // Holder failed or did not cache; compete for the lock again
                }
                WaitOutcome::TimedOut => {
                    bump(&inner.counters.lock_timeouts);
                    if let Some(metrics) = &inner.metrics {
                        metrics.inc_lock_timeouts();
                    }
                    let timeout = Error::LockTimeout {
                        key: key.to_string(),
                        waited_ms: lock_timeout.as_millis() as u64,
                    };
                    let held_ms = inner.locks.held_for(key).map(|d| d.as_millis() as u64);
                    warn!(error = %timeout, ?held_ms, "Loading directly");
                    if let Some(value) = inner.manager.get::<V>(key).await {
                        return Ok(value);
                    }
                    bump(&inner.counters.direct_loads);
                    break None;
                }
            }
        };

        bump(&inner.counters.loads);
        let value = match loader().await {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "Loader failed, releasing lock");
                return Err(e);
            }
        };
        inner.manager.set(key, &value, Some(ttl)).await;
        drop(guard);
        Ok(value)
    }
}

// =============================================================================
// Tests
// =============================================================================
