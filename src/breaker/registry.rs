//! Breaker Registry
//!
//! Named breakers shared across one process. Owned by the [`crate::Bulwark`]
//! context rather than living in a global.

use std::sync::Arc;

use dashmap::DashMap;

use super::circuit::{BreakerConfig, BreakerMetrics, CircuitBreaker};
use super::listener::BreakerListener;

/// Registry of named circuit breakers
pub struct BreakerRegistry {
    /// Configuration for breakers created on demand
    defaults: BreakerConfig,
    /// Listeners attached to every breaker the registry creates
    listeners: Vec<Arc<dyn BreakerListener>>,
    /// Breakers by name
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            listeners: Vec::new(),
            breakers: DashMap::new(),
        }
    }

    /// Attach a listener to all breakers created from now on
    pub fn with_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Default breaker configuration
    pub fn defaults(&self) -> &BreakerConfig {
        &self.defaults
    }

    /// Get the named breaker, creating it with the default configuration
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.defaults.clone())
    }

    /// Get the named breaker, creating it with `config` if absent
    ///
    /// An existing breaker keeps its original configuration.
    pub fn get_or_create_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Creating circuit breaker");
                Arc::new(
                    CircuitBreaker::new(name, config)
                        .with_listeners(self.listeners.iter().cloned()),
                )
            })
            .clone()
    }

    /// Look up a breaker without creating it
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Remove a breaker
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    /// Registered breaker names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Metrics for every breaker, sorted by name
    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        let mut metrics: Vec<BreakerMetrics> =
            self.breakers.iter().map(|e| e.value().metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Reset every breaker to CLOSED
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// Number of breakers
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// True when no breakers exist
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("breakers", &self.names())
            .finish()
    }
}
