//! Write-Through and Write-Behind

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::{bump, AdvancedCache};

impl AdvancedCache {
    /// Persist first, then cache
    ///
    /// A persist failure is returned and nothing is cached.
    pub async fn write_through<V, E, F, Fut>(
        &self,
        key: &str,
        value: V,
        ttl: Duration,
        persist: F,
    ) -> Result<V, E>
    where
        V: Serialize + Clone,
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        persist(value.clone()).await?;
        if !self.inner.manager.set(key, &value, Some(ttl)).await {
            warn!(key, "Persisted value could not be cached");
        }
        Ok(value)
    }

    /// Cache now, persist after the configured write delay
    ///
    /// Returns whether the cache write succeeded. Persist failures are logged
    /// and counted, never returned.
    pub async fn write_behind<V, E, F, Fut>(&self, key: &str, value: V, ttl: Duration, persist: F) -> bool
    where
        V: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let cached = self.inner.manager.set(key, &value, Some(ttl)).await;

        bump(&self.inner.counters.write_behind_scheduled);
        let inner = self.inner.clone();
        let key = key.to_string();
        let delay = self.inner.config.write_delay;

        self.inner.tasks.spawn(async move {
            tokio::time::sleep(delay).await;

            let failed = match AssertUnwindSafe(persist(value)).catch_unwind().await {
                Ok(Ok(())) => {
                    debug!(key = %key, "Write-behind persist completed");
                    false
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Write-behind persist failed");
                    true
                }
                Err(_) => {
                    error!(key = %key, "Write-behind persist panicked");
                    true
                }
            };

            if failed {
                bump(&inner.counters.write_behind_failures);
                if let Some(metrics) = &inner.metrics {
                    metrics.inc_background_failure("write_behind");
                }
            }
        });

        cached
    }
}

// =============================================================================
// Tests
// =============================================================================
