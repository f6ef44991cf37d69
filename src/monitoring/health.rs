//! Health Reporting
//!
//! Aggregates the cache round-trip probe and breaker states into a single
//! response, plus process liveness and readiness flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::breaker::{BreakerMetrics, CircuitState};
use crate::cache::CacheHealth;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with some dependency short-circuited
    Degraded,
    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    /// Healthy or degraded
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of one named check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Detail for non-healthy results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Cache round-trip probe; a failed probe makes the service unhealthy
    pub fn from_cache(health: &CacheHealth) -> Self {
        let name = format!("cache:{}", health.strategy);
        let result = if health.healthy {
            Self::healthy(name)
        } else {
            Self::unhealthy(
                name,
                health
                    .error
                    .clone()
                    .unwrap_or_else(|| "round-trip failed".to_string()),
            )
        };
        result.with_duration(Duration::from_millis(health.latency_ms))
    }

    /// Breaker state; an open or probing breaker degrades the service
    pub fn from_breaker(metrics: &BreakerMetrics) -> Self {
        let name = format!("breaker:{}", metrics.name);
        match metrics.state {
            CircuitState::Closed => Self::healthy(name),
            state => Self::degraded(
                name,
                format!("{} after {} consecutive failures", state, metrics.failure_count),
            ),
        }
    }
}

impl HealthCheckResult {
    /// Summary of per-key cache breakers
    ///
    /// Always healthy: one failing key does not degrade the service. The
    /// message counts breakers that are not CLOSED.
    pub fn from_key_breakers(breakers: &[BreakerMetrics]) -> Self {
        let tripped = breakers
            .iter()
            .filter(|b| b.state != CircuitState::Closed)
            .count();
        let mut result = Self::healthy("key_breakers");
        if tripped > 0 {
            result.message = Some(format!("{} of {} per-key breakers not closed", tripped, breakers.len()));
        }
        result
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Individual check results
    pub checks: Vec<HealthCheckResult>,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Process liveness and readiness flags
#[derive(Debug)]
pub struct HealthProbe {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthProbe {
    /// Live but not yet ready
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Liveness as a check result
    pub fn liveness_check(&self) -> HealthCheckResult {
        if self.is_live() {
            HealthCheckResult::healthy("liveness")
        } else {
            HealthCheckResult::unhealthy("liveness", "Shutting down")
        }
    }

    /// Readiness as a check result
    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "Service not ready")
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
