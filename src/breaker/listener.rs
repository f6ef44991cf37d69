//! Breaker Notification Hooks
//!
//! Listeners observe breaker activity for logging and alerting. They run
//! after the breaker lock is released; a panicking listener is caught and
//! logged so it can never change the outcome of a call.

use super::CircuitState;

/// Observer of circuit breaker events
///
/// Every method has a no-op default so implementations only override what
/// they care about.
pub trait BreakerListener: Send + Sync {
    /// Called after the breaker moves from `from` to `to`
    fn on_state_change(&self, _breaker: &str, _from: CircuitState, _to: CircuitState) {}

    /// Called after the wrapped operation fails
    fn on_failure(&self, _breaker: &str, _error: &str) {}

    /// Called after the wrapped operation succeeds
    fn on_success(&self, _breaker: &str) {}
}

/// Listener that writes breaker events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl BreakerListener for TracingListener {
    fn on_state_change(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => {
                tracing::warn!(breaker, %from, %to, "Circuit breaker opened")
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker, %from, %to, "Circuit breaker half-open, allowing trial call")
            }
            CircuitState::Closed => {
                tracing::info!(breaker, %from, %to, "Circuit breaker closed")
            }
        }
    }

    fn on_failure(&self, breaker: &str, error: &str) {
        tracing::debug!(breaker, error, "Protected operation failed");
    }
}
