//! Breaker-Wrapped Cache Access
//!
//! Each key gets its own [`CircuitBreaker`], named `cache:{key}`. Successful
//! loads also fill a long-lived stale slot (`{key}:stale`) that is served
//! while the key's breaker is OPEN.
//!
//! A key's breaker only lives while it has something to remember: it is
//! dropped once a load leaves it CLOSED with no failures, and pruned after
//! `key_breaker_idle` without calls.

use std::fmt;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::AdvancedCache;
use crate::breaker::{BreakerConfig, BreakerError, BreakerMetrics, CircuitBreaker};

const PRUNE_EVERY: u64 = 64;

pub(super) fn stale_key(key: &str) -> String {
    format!("{}:stale", key)
}

pub(super) fn breaker_name(key: &str) -> String {
    format!("cache:{}", key)
}

/// Options for [`AdvancedCache::cache_with_circuit_breaker`]
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedOptions {
    /// TTL of a successfully loaded value
    pub ttl: Duration,
    /// Consecutive loader failures that open the key's breaker
    pub failure_threshold: u32,
    /// How long the key's breaker stays OPEN before a trial load
    pub recovery_timeout: Duration,
    /// TTL of a value loaded while the breaker is OPEN and no stale copy exists
    pub fallback_ttl: Duration,
    /// TTL of the stale slot
    pub stale_ttl: Duration,
}

impl GuardedOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            fallback_ttl: Duration::from_secs(60),
            stale_ttl: ttl.saturating_mul(10),
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn fallback_ttl(mut self, ttl: Duration) -> Self {
        self.fallback_ttl = ttl;
        self
    }

    pub fn stale_ttl(mut self, ttl: Duration) -> Self {
        self.stale_ttl = ttl;
        self
    }
}

impl Default for GuardedOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl AdvancedCache {
    /// Cache-aside read whose loader is protected by a per-key breaker
    ///
    /// A loader failure is returned to the caller. Once the key's breaker is
    /// OPEN the loader is skipped and the stale slot is served; if there is
    /// no stale copy the loader runs once directly and its value is cached
    /// for `fallback_ttl`.
    pub async fn cache_with_circuit_breaker<V, E, F, Fut>(
        &self,
        key: &str,
        options: &GuardedOptions,
        loader: F,
    ) -> Result<V, E>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        E: fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let manager = &self.inner.manager;
        if let Some(value) = manager.get::<V>(key).await {
            return Ok(value);
        }

        let breaker = self.key_breaker(key, options);
        match breaker.execute(&loader).await {
            Ok(value) => {
                self.release_settled_breaker(key, &breaker);
                manager.set(key, &value, Some(options.ttl)).await;
                manager
                    .set(&stale_key(key), &value, Some(options.stale_ttl))
                    .await;
                Ok(value)
            }
            Err(BreakerError::Failed(e)) => Err(e),
            Err(BreakerError::Open { name }) => {
                if let Some(stale) = manager.get::<V>(&stale_key(key)).await {
                    debug!(key, breaker = %name, "Breaker open, serving stale value");
                    return Ok(stale);
                }

                warn!(key, breaker = %name, "Breaker open with no stale value, loading directly");
                let value = loader().await?;
                manager.set(key, &value, Some(options.fallback_ttl)).await;
                Ok(value)
            }
        }
    }

    /// The breaker guarding `key`, if one has been created
    pub fn key_breaker_for(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.breakers.get(key).map(|b| b.clone())
    }

    /// Metrics of every live per-key breaker, after pruning idle ones
    pub fn key_breaker_metrics(&self) -> Vec<BreakerMetrics> {
        self.prune_key_breakers();
        self.inner.breakers.iter().map(|b| b.metrics()).collect()
    }

    /// Drop per-key breakers idle for longer than `key_breaker_idle`
    ///
    /// A breaker is never pruned before its own recovery timeout has passed
    /// since its last call. Returns the number removed.
    pub fn prune_key_breakers(&self) -> usize {
        let idle_limit = self.inner.config.key_breaker_idle;
        let is_idle = |b: &CircuitBreaker| b.idle_for() >= idle_limit.max(b.config().recovery_timeout);

        let candidates: Vec<String> = self
            .inner
            .breakers
            .iter()
            .filter(|entry| is_idle(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            if self.inner.breakers.remove_if(&key, |_, b| is_idle(b)).is_some() {
                self.forget_key_breaker(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned idle per-key breakers");
        }
        removed
    }

    pub(super) fn forget_key_breaker(&self, key: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.forget_breaker(&breaker_name(key));
        }
    }

    fn release_settled_breaker(&self, key: &str, breaker: &Arc<CircuitBreaker>) {
        let released = self
            .inner
            .breakers
            .remove_if(key, |_, b| Arc::ptr_eq(b, breaker) && b.is_settled())
            .is_some();
        if released {
            self.forget_key_breaker(key);
        }
    }

    fn key_breaker(&self, key: &str, options: &GuardedOptions) -> Arc<CircuitBreaker> {
        let mut created = false;
        let breaker = self
            .inner
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                created = true;
                let config = BreakerConfig::new(options.failure_threshold, options.recovery_timeout);
                Arc::new(
                    CircuitBreaker::new(breaker_name(key), config)
                        .with_listeners(self.inner.listeners.iter().cloned()),
                )
            })
            .clone();

        // Amortized sweep so keys that are never requested again do not pile up
        if created {
            let n = self.inner.counters.key_breakers_created.fetch_add(1, Ordering::Relaxed) + 1;
            if n % PRUNE_EVERY == 0 {
                self.prune_key_breakers();
            }
        }
        breaker
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::coordinator::tests::coordinator;
    use crate::coordinator::CoordinatorConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn options() -> GuardedOptions {
        GuardedOptions::new(Duration::from_secs(60))
            .failure_threshold(3)
            .recovery_timeout(Duration::from_secs(30))
            .fallback_ttl(Duration::from_secs(10))
    }

    #[test]
    fn test_options_defaults() {
        let opts = GuardedOptions::new(Duration::from_secs(30));
        assert_eq!(opts.failure_threshold, 5);
        assert_eq!(opts.recovery_timeout, Duration::from_secs(60));
        assert_eq!(opts.stale_ttl, Duration::from_secs(300));
        assert_eq!(stale_key("user:1"), "user:1:stale");
        assert_eq!(breaker_name("user:1"), "cache:user:1");
    }

    #[tokio::test]
    async fn test_success_fills_value_and_stale_slot() {
        let cache = coordinator(CoordinatorConfig::default());

        let value: Result<String, String> = cache
            .cache_with_circuit_breaker("k", &options(), || async { Ok("v".to_string()) })
            .await;
        assert_eq!(value.unwrap(), "v");

        let manager = cache.manager();
        assert_eq!(manager.get::<String>("k").await.as_deref(), Some("v"));
        assert_eq!(manager.get::<String>("k:stale").await.as_deref(), Some("v"));
        // Nothing to remember after a clean load
        assert_eq!(cache.stats().key_breakers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_serves_stale_value() {
        let cache = coordinator(CoordinatorConfig::default());
        let opts = options();
        let healthy = AtomicBool::new(true);
        let calls = AtomicUsize::new(0);

        let load = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            if healthy.load(Ordering::SeqCst) {
                Ok("good".to_string())
            } else {
                Err("downstream failed".to_string())
            }
        };

        assert_eq!(cache.cache_with_circuit_breaker("k", &opts, load).await.unwrap(), "good");

        // Primary entry expires, the stale slot survives
        tokio::time::advance(Duration::from_secs(61)).await;
        healthy.store(false, Ordering::SeqCst);

        for _ in 0..3 {
            let err = cache.cache_with_circuit_breaker("k", &opts, load).await.unwrap_err();
            assert_eq!(err, "downstream failed");
        }
        let breaker = cache.key_breaker_for("k").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.name(), "cache:k");

        let before = calls.load(Ordering::SeqCst);
        let served = cache.cache_with_circuit_breaker("k", &opts, load).await.unwrap();
        assert_eq!(served, "good");
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_without_stale_loads_with_fallback_ttl() {
        let cache = coordinator(CoordinatorConfig::default());
        let opts = options();
        let healthy = AtomicBool::new(false);

        let load = || async {
            if healthy.load(Ordering::SeqCst) {
                Ok(1u32)
            } else {
                Err("down".to_string())
            }
        };

        for _ in 0..3 {
            assert!(cache.cache_with_circuit_breaker("k", &opts, load).await.is_err());
        }
        assert_eq!(cache.key_breaker_for("k").unwrap().state(), CircuitState::Open);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(cache.cache_with_circuit_breaker("k", &opts, load).await.unwrap(), 1);
        assert_eq!(cache.manager().get::<u32>("k").await, Some(1));
        assert_eq!(cache.manager().get::<u32>("k:stale").await, None);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.manager().get::<u32>("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_recovers_after_timeout() {
        let cache = coordinator(CoordinatorConfig::default());
        let opts = options();
        let healthy = AtomicBool::new(false);

        let load = || async {
            if healthy.load(Ordering::SeqCst) {
                Ok("back".to_string())
            } else {
                Err("down".to_string())
            }
        };

        for _ in 0..3 {
            assert!(cache.cache_with_circuit_breaker("k", &opts, load).await.is_err());
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        healthy.store(true, Ordering::SeqCst);

        let breaker = cache.key_breaker_for("k").unwrap();
        assert_eq!(cache.cache_with_circuit_breaker("k", &opts, load).await.unwrap(), "back");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(cache.key_breaker_for("k").is_none());
    }

    #[tokio::test]
    async fn test_breakers_are_per_key() {
        let cache = coordinator(CoordinatorConfig::default());
        let opts = options().failure_threshold(1);

        let failed: Result<u32, String> = cache
            .cache_with_circuit_breaker("a", &opts, || async { Err("down".to_string()) })
            .await;
        assert!(failed.is_err());

        let ok: Result<u32, String> = cache
            .cache_with_circuit_breaker("b", &opts, || async { Ok(2) })
            .await;
        assert_eq!(ok.unwrap(), 2);

        assert_eq!(cache.key_breaker_for("a").unwrap().state(), CircuitState::Open);
        assert!(cache.key_breaker_for("b").is_none());

        cache.invalidate("a").await;
        assert!(cache.key_breaker_for("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_below_threshold_releases_breaker() {
        let cache = coordinator(CoordinatorConfig::default());
        let opts = options();

        let failed: Result<u32, String> = cache
            .cache_with_circuit_breaker("k", &opts, || async { Err("blip".to_string()) })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.key_breaker_for("k").unwrap().failure_count(), 1);

        let ok: Result<u32, String> = cache
            .cache_with_circuit_breaker("k", &opts, || async { Ok(3) })
            .await;
        assert_eq!(ok.unwrap(), 3);
        assert_eq!(cache.stats().key_breakers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_breakers_are_pruned() {
        let cache = coordinator(CoordinatorConfig::default());
        let opts = options()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(1));

        for i in 0..1000 {
            let key = format!("item:{}", i);
            let failed: Result<u32, String> = cache
                .cache_with_circuit_breaker(&key, &opts, || async { Err("down".to_string()) })
                .await;
            assert!(failed.is_err());
        }
        assert_eq!(cache.stats().key_breakers, 1000);
        assert_eq!(cache.prune_key_breakers(), 0);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(cache.key_breaker_metrics().is_empty());
        assert_eq!(cache.stats().key_breakers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_outlives_idle_limit_until_recovery() {
        let config = CoordinatorConfig {
            key_breaker_idle: Duration::from_secs(1),
            ..Default::default()
        };
        let cache = coordinator(config);
        let opts = options().failure_threshold(1);

        let failed: Result<u32, String> = cache
            .cache_with_circuit_breaker("k", &opts, || async { Err("down".to_string()) })
            .await;
        assert!(failed.is_err());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.prune_key_breakers(), 0);
        assert_eq!(cache.key_breaker_for("k").unwrap().state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.prune_key_breakers(), 1);
    }
}
