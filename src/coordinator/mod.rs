//! Advanced Cache Coordinator
//!
//! Access patterns layered on [`CacheManager`] and [`CircuitBreaker`].
//!
//! # Patterns
//!
//! | Pattern                       | Method                                        |
//! |-------------------------------|-----------------------------------------------|
//! | Stampede-protected load       | [`AdvancedCache::cache_aside_with_lock`]      |
//! | Stale-while-revalidate        | [`AdvancedCache::stale_while_revalidate`]     |
//! | Write-through / write-behind  | [`AdvancedCache::write_through`] / [`AdvancedCache::write_behind`] |
//! | Multi-level (L1 / L2)         | [`AdvancedCache::get_multi_level`]            |
//! | Breaker-wrapped access        | [`AdvancedCache::cache_with_circuit_breaker`] |
//!
//! Loader and persist errors reach the caller unchanged, except in
//! background refreshes and write-behind persists where they are logged and
//! counted. Cache failures are absorbed by the manager and behave as misses.
//!
//! Background work runs on a [`TaskTracker`]; [`AdvancedCache::wait_for_background`]
//! drains it at shutdown.

mod guarded;
mod multi_level;
mod stampede;
mod swr;
mod write;

pub use guarded::GuardedOptions;
pub use multi_level::CacheLevel;
pub use stampede::{LockGuard, LockRegistry, WaitOutcome};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::task::TaskTracker;

use crate::breaker::{BreakerListener, CircuitBreaker};
use crate::cache::CacheManager;
use crate::monitoring::BulwarkMetrics;

// =============================================================================
// Configuration
// =============================================================================

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Default bound on how long a stampede waiter waits for another loader
    pub lock_timeout: Duration,
    /// Interval at which waiters re-check the lock
    pub lock_poll_interval: Duration,
    /// Delay before a write-behind persist runs
    pub write_delay: Duration,
    /// TTL of values promoted into L1
    pub l1_ttl: Duration,
    /// Per-key breakers unused for this long (and at least their recovery
    /// timeout) are dropped
    pub key_breaker_idle: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(50),
            write_delay: Duration::from_secs(1),
            l1_ttl: Duration::from_secs(60),
            key_breaker_idle: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Coordinator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Loader invocations made under a lock or after a lock timeout
    pub loads: u64,
    /// Waiters served from cache after another caller's load
    pub stampede_prevented: u64,
    /// Waiters that gave up on the lock
    pub lock_timeouts: u64,
    /// Loads made without holding the lock after a timeout
    pub direct_loads: u64,
    /// Background refreshes started
    pub background_refreshes: u64,
    /// Background refreshes that failed
    pub background_refresh_failures: u64,
    /// Write-behind persists scheduled
    pub write_behind_scheduled: u64,
    /// Write-behind persists that failed
    pub write_behind_failures: u64,
    /// Loads currently holding a lock
    pub active_locks: usize,
    /// Per-key breakers alive
    pub key_breakers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    stampede_prevented: AtomicU64,
    lock_timeouts: AtomicU64,
    direct_loads: AtomicU64,
    background_refreshes: AtomicU64,
    background_refresh_failures: AtomicU64,
    write_behind_scheduled: AtomicU64,
    write_behind_failures: AtomicU64,
    key_breakers_created: AtomicU64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// =============================================================================
// Advanced Cache
// =============================================================================

struct Inner {
    manager: Arc<CacheManager>,
    config: CoordinatorConfig,
    locks: LockRegistry,
    /// Keys with a background refresh in flight
    refreshing: DashMap<String, ()>,
    /// Breakers for `cache_with_circuit_breaker`, one per key
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    listeners: Vec<Arc<dyn BreakerListener>>,
    tasks: TaskTracker,
    counters: Counters,
    metrics: Option<BulwarkMetrics>,
}

/// Coordinator for the advanced cache access patterns
///
/// Cheap to clone; clones share locks, breakers and background tasks.
#[derive(Clone)]
pub struct AdvancedCache {
    inner: Arc<Inner>,
}

impl AdvancedCache {
    /// Create over a cache manager
    pub fn new(manager: Arc<CacheManager>, config: CoordinatorConfig) -> Self {
        Self::build(manager, config, Vec::new(), None)
    }

    /// Create with breaker listeners and metrics
    pub fn with_observability(
        manager: Arc<CacheManager>,
        config: CoordinatorConfig,
        listeners: Vec<Arc<dyn BreakerListener>>,
        metrics: Option<BulwarkMetrics>,
    ) -> Self {
        Self::build(manager, config, listeners, metrics)
    }

    fn build(
        manager: Arc<CacheManager>,
        config: CoordinatorConfig,
        listeners: Vec<Arc<dyn BreakerListener>>,
        metrics: Option<BulwarkMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                locks: LockRegistry::new(config.lock_poll_interval),
                config,
                refreshing: DashMap::new(),
                breakers: DashMap::new(),
                listeners,
                tasks: TaskTracker::new(),
                counters: Counters::default(),
                metrics,
            }),
        }
    }

    /// Underlying cache manager
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.inner.manager
    }

    /// Configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Stampede lock registry
    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    /// Snapshot of counters
    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            loads: c.loads.load(Ordering::Relaxed),
            stampede_prevented: c.stampede_prevented.load(Ordering::Relaxed),
            lock_timeouts: c.lock_timeouts.load(Ordering::Relaxed),
            direct_loads: c.direct_loads.load(Ordering::Relaxed),
            background_refreshes: c.background_refreshes.load(Ordering::Relaxed),
            background_refresh_failures: c.background_refresh_failures.load(Ordering::Relaxed),
            write_behind_scheduled: c.write_behind_scheduled.load(Ordering::Relaxed),
            write_behind_failures: c.write_behind_failures.load(Ordering::Relaxed),
            active_locks: self.inner.locks.len(),
            key_breakers: self.inner.breakers.len(),
        }
    }

    /// Background tasks still running
    pub fn background_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Wait for every background refresh and write-behind persist scheduled so far
    pub async fn wait_for_background(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Remove a key from every strategy along with its stale slot and breaker
    ///
    /// Returns whether a value was removed from any store.
    pub async fn invalidate(&self, key: &str) -> bool {
        let manager = &self.inner.manager;
        let stale_key = guarded::stale_key(key);

        let mut removed = false;
        for kind in manager.registered_strategies() {
            removed |= manager.delete_from(kind, key).await;
            manager.delete_from(kind, &stale_key).await;
        }

        if self.inner.breakers.remove(key).is_some() {
            self.forget_key_breaker(key);
        }

        tracing::debug!(key, removed, "Invalidated cache key");
        removed
    }
}

impl std::fmt::Debug for AdvancedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvancedCache")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
