//! Observability
//!
//! Prometheus metrics and health reporting.
//!
//! ```text
//! ┌──────────────────────────────┐   ┌─────────────────────────────────┐
//! │ BulwarkMetrics (Prometheus)  │   │ Health                          │
//! │  cache ops, breaker state,   │   │  cache round-trip, breaker      │
//! │  stampede, background tasks  │   │  states, liveness / readiness   │
//! └──────────────────────────────┘   └─────────────────────────────────┘
//! ```

mod health;
mod metrics;

pub use health::{HealthCheckResult, HealthProbe, HealthResponse, HealthStatus};
pub use metrics::{BulwarkMetrics, MetricsListener};
