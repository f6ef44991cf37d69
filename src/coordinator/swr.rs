//! Stale-While-Revalidate
//!
//! Values are stored as [`Timestamped`] so their age can be computed on read.
//! The store TTL is the stale window, so entries outlive their freshness and
//! can still be served while a background refresh replaces them.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::{bump, AdvancedCache, Inner};
use crate::cache::Timestamped;

/// Clears the in-flight refresh marker when the refresh task ends
struct RefreshSlot {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for RefreshSlot {
    fn drop(&mut self) {
        self.inner.refreshing.remove(&self.key);
    }
}

impl AdvancedCache {
    /// Serve fresh or stale-but-usable values immediately
    ///
    /// - `age < ttl`: cached value
    /// - `ttl <= age < stale_time`: cached value, plus one background
    ///   refresh when `background_refresh` is set
    /// - otherwise (or on a miss): synchronous load
    pub async fn stale_while_revalidate<V, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        stale_time: Duration,
        background_refresh: bool,
        loader: F,
    ) -> Result<V, E>
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let store_ttl = stale_time.max(ttl);

        if let Some(entry) = self.inner.manager.get_with_metadata::<V>(key).await {
            let age = entry.age();
            if age < ttl {
                return Ok(entry.value);
            }
            if age < stale_time {
                debug!(key, age_ms = age.as_millis() as u64, "Serving stale value");
                if background_refresh {
                    self.spawn_refresh(key, store_ttl, loader);
                }
                return Ok(entry.value);
            }
        }

        let value = loader().await?;
        self.inner
            .manager
            .set_with_metadata(key, &value, Some(store_ttl))
            .await;
        Ok(value)
    }

    /// Whether a background refresh for `key` is in flight
    pub fn is_refreshing(&self, key: &str) -> bool {
        self.inner.refreshing.contains_key(key)
    }

    fn spawn_refresh<V, E, F, Fut>(&self, key: &str, store_ttl: Duration, loader: F)
    where
        V: Serialize + Send + Sync + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        if self.inner.refreshing.insert(key.to_string(), ()).is_some() {
            debug!(key, "Refresh already in flight");
            return;
        }
        bump(&self.inner.counters.background_refreshes);

        let slot = RefreshSlot {
            inner: self.inner.clone(),
            key: key.to_string(),
        };

        self.inner.tasks.spawn(async move {
            let outcome = AssertUnwindSafe(loader()).catch_unwind().await;
            let inner = &slot.inner;
            let key = slot.key.as_str();

            match outcome {
                Ok(Ok(value)) => {
                    inner
                        .manager
                        .set_with_metadata(key, &value, Some(store_ttl))
                        .await;
                    debug!(key, "Background refresh stored new value");
                    return;
                }
                Ok(Err(e)) => warn!(key, error = %e, "Background refresh failed"),
                Err(_) => error!(key, "Background refresh panicked"),
            }

            bump(&inner.counters.background_refresh_failures);
            if let Some(metrics) = &inner.metrics {
                metrics.inc_background_failure("refresh");
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::tests::coordinator;
    use crate::coordinator::CoordinatorConfig;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_secs(60);
    const STALE: Duration = Duration::from_secs(300);

    async fn seed(cache: &AdvancedCache, key: &str, value: &str, age_secs: i64) {
        let stamped = Timestamped::at(value.to_string(), Utc::now() - chrono::Duration::seconds(age_secs));
        cache.manager().set(key, &stamped, Some(STALE)).await;
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<String, String>> + Send + 'static {
        let calls = calls.clone();
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_fresh_value_skips_loader() {
        let cache = coordinator(CoordinatorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&cache, "k", "cached", 59).await;

        let value = cache
            .stale_while_revalidate("k", TTL, STALE, true, counting_loader(&calls, "new"))
            .await
            .unwrap();

        assert_eq!(value, "cached");
        cache.wait_for_background().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_value_served_and_refreshed_once() {
        let cache = coordinator(CoordinatorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&cache, "k", "stale", 120).await;

        let first = cache
            .stale_while_revalidate("k", TTL, STALE, true, counting_loader(&calls, "fresh"))
            .await
            .unwrap();
        let second = cache
            .stale_while_revalidate("k", TTL, STALE, true, counting_loader(&calls, "fresh"))
            .await
            .unwrap();

        assert_eq!(first, "stale");
        assert_eq!(second, "stale");

        cache.wait_for_background().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().background_refreshes, 1);
        assert!(!cache.is_refreshing("k"));

        let stored = cache.manager().get_with_metadata::<String>("k").await.unwrap();
        assert_eq!(stored.value, "fresh");
        assert!(stored.age() < TTL);
    }

    #[tokio::test]
    async fn test_stale_without_background_refresh() {
        let cache = coordinator(CoordinatorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&cache, "k", "stale", 120).await;

        let value = cache
            .stale_while_revalidate("k", TTL, STALE, false, counting_loader(&calls, "fresh"))
            .await
            .unwrap();

        assert_eq!(value, "stale");
        cache.wait_for_background().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_value_loads_synchronously() {
        let cache = coordinator(CoordinatorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        seed(&cache, "k", "ancient", 301).await;

        let value = cache
            .stale_while_revalidate("k", TTL, STALE, true, counting_loader(&calls, "fresh"))
            .await
            .unwrap();

        assert_eq!(value, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().background_refreshes, 0);
    }

    #[tokio::test]
    async fn test_miss_propagates_loader_error() {
        let cache = coordinator(CoordinatorConfig::default());
        let result: Result<String, String> = cache
            .stale_while_revalidate("k", TTL, STALE, true, || async { Err("down".to_string()) })
            .await;
        assert_eq!(result.unwrap_err(), "down");
    }

    #[tokio::test]
    async fn test_background_failure_is_swallowed() {
        let cache = coordinator(CoordinatorConfig::default());
        seed(&cache, "k", "stale", 120).await;

        let value: Result<String, String> = cache
            .stale_while_revalidate("k", TTL, STALE, true, || async { Err("down".to_string()) })
            .await;
        assert_eq!(value.unwrap(), "stale");

        cache.wait_for_background().await;
        assert_eq!(cache.stats().background_refresh_failures, 1);
        assert!(!cache.is_refreshing("k"));

        let stored = cache.manager().get_with_metadata::<String>("k").await.unwrap();
        assert_eq!(stored.value, "stale");
    }
}
