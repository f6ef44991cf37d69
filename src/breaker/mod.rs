//! Circuit Breaker
//!
//! Failure accounting around calls to unreliable downstream operations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           BreakerRegistry                                 │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  "payments" ──▶ CircuitBreaker ─┐                                         │
//! │  "search"   ──▶ CircuitBreaker ─┼──▶ BreakerListener (tracing, metrics)   │
//! │  "cache:*"  ──▶ CircuitBreaker ─┘                                         │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `recovery_timeout` is an elapsed-time gate checked lazily on the next call;
//! no timer runs while a breaker is OPEN.

mod circuit;
mod listener;
mod registry;

pub use circuit::{BreakerConfig, BreakerError, BreakerMetrics, CircuitBreaker, Fallback};
pub use listener::{BreakerListener, TracingListener};
pub use registry::BreakerRegistry;

use serde::{Deserialize, Serialize};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Short-circuiting calls
    Open,
    /// Admitting a single trial call
    HalfOpen,
}

impl CircuitState {
    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
