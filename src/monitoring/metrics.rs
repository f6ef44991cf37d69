//! Prometheus Metrics
//!
//! Counters and gauges for cache operations, breaker state and background
//! work. Each [`BulwarkMetrics`] owns its own registry so several contexts
//! (and tests) can coexist in one process.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::breaker::{BreakerListener, CircuitState};
use crate::error::Result;

/// Metric namespace
const NAMESPACE: &str = "bulwark";

/// Prometheus metrics for a Bulwark context
#[derive(Clone)]
pub struct BulwarkMetrics {
    registry: Registry,
    cache_ops: IntCounterVec,
    breaker_state: IntGaugeVec,
    breaker_transitions: IntCounterVec,
    stampede_prevented: IntCounter,
    lock_timeouts: IntCounter,
    background_failures: IntCounterVec,
}

impl BulwarkMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let cache_ops = IntCounterVec::new(
            Opts::new("cache_operations_total", "Cache operations by type and outcome")
                .namespace(NAMESPACE),
            &["op", "result"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "breaker_state",
                "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
            )
            .namespace(NAMESPACE),
            &["breaker"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("breaker_transitions_total", "Circuit breaker state transitions")
                .namespace(NAMESPACE),
            &["breaker", "to"],
        )?;
        let stampede_prevented = IntCounter::with_opts(
            Opts::new(
                "stampede_prevented_total",
                "Waiters served from cache after another caller's load",
            )
            .namespace(NAMESPACE),
        )?;
        let lock_timeouts = IntCounter::with_opts(
            Opts::new(
                "lock_timeouts_total",
                "Stampede waiters that gave up and loaded directly",
            )
            .namespace(NAMESPACE),
        )?;
        let background_failures = IntCounterVec::new(
            Opts::new(
                "background_failures_total",
                "Failed background refreshes and write-behind persists",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(cache_ops.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(stampede_prevented.clone()))?;
        registry.register(Box::new(lock_timeouts.clone()))?;
        registry.register(Box::new(background_failures.clone()))?;

        Ok(Self {
            registry,
            cache_ops,
            breaker_state,
            breaker_transitions,
            stampede_prevented,
            lock_timeouts,
            background_failures,
        })
    }

    /// Registry holding every metric
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count a cache operation (`op` = get/set/delete/clear, `result` = hit/miss/ok/error)
    pub fn record_cache_op(&self, op: &str, result: &str) {
        self.cache_ops.with_label_values(&[op, result]).inc();
    }

    /// Current count for an operation/outcome pair
    pub fn cache_op_count(&self, op: &str, result: &str) -> u64 {
        self.cache_ops.with_label_values(&[op, result]).get()
    }

    /// Record a breaker transition and update its state gauge
    pub fn record_breaker_transition(&self, breaker: &str, to: CircuitState) {
        self.breaker_state
            .with_label_values(&[breaker])
            .set(to.as_gauge());
        self.breaker_transitions
            .with_label_values(&[breaker, to.as_str()])
            .inc();
    }

    /// Current gauge value for a breaker
    pub fn breaker_state(&self, breaker: &str) -> i64 {
        self.breaker_state.with_label_values(&[breaker]).get()
    }

    /// Drop the series of a breaker that no longer exists
    pub fn forget_breaker(&self, breaker: &str) {
        let _ = self.breaker_state.remove_label_values(&[breaker]);
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            let _ = self
                .breaker_transitions
                .remove_label_values(&[breaker, state.as_str()]);
        }
    }

    pub fn inc_stampede_prevented(&self) {
        self.stampede_prevented.inc();
    }

    pub fn inc_lock_timeouts(&self) {
        self.lock_timeouts.inc();
    }

    /// Count a failed background task (`refresh` or `write_behind`)
    pub fn inc_background_failure(&self, kind: &str) {
        self.background_failures.with_label_values(&[kind]).inc();
    }

    /// Encode in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for BulwarkMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulwarkMetrics").finish_non_exhaustive()
    }
}

/// Breaker listener feeding [`BulwarkMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsListener {
    metrics: BulwarkMetrics,
}

impl MetricsListener {
    pub fn new(metrics: BulwarkMetrics) -> Self {
        Self { metrics }
    }
}

impl BreakerListener for MetricsListener {
    fn on_state_change(&self, breaker: &str, _from: CircuitState, to: CircuitState) {
        self.metrics.record_breaker_transition(breaker, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_cache_op_counter() {
        let metrics = BulwarkMetrics::new().unwrap();
        metrics.record_cache_op("get", "hit");
        metrics.record_cache_op("get", "hit");
        metrics.record_cache_op("get", "miss");

        assert_eq!(metrics.cache_op_count("get", "hit"), 2);
        assert_eq!(metrics.cache_op_count("get", "miss"), 1);
    }

    #[test]
    fn test_encode_contains_namespace() {
        let metrics = BulwarkMetrics::new().unwrap();
        metrics.inc_stampede_prevented();
        metrics.inc_background_failure("refresh");

        let text = metrics.encode().unwrap();
        assert!(text.contains("bulwark_stampede_prevented_total 1"));
        assert!(text.contains("bulwark_background_failures_total{kind=\"refresh\"} 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = BulwarkMetrics::new().unwrap();
        let b = BulwarkMetrics::new().unwrap();
        a.inc_lock_timeouts();
        assert!(!b.encode().unwrap().contains("bulwark_lock_timeouts_total 1"));
    }

    #[tokio::test]
    async fn test_listener_tracks_breaker_state() {
        let metrics = BulwarkMetrics::new().unwrap();
        let breaker = CircuitBreaker::new("payments", BreakerConfig::new(1, Duration::from_secs(60)))
            .with_listener(Arc::new(MetricsListener::new(metrics.clone())));

        let _ = breaker.execute(|| async { Err::<(), _>("down") }).await;
        assert_eq!(metrics.breaker_state("payments"), CircuitState::Open.as_gauge());

        breaker.force_close();
        assert_eq!(metrics.breaker_state("payments"), 0);
    }
}
