//! Bulwark - Resilience and Caching Toolkit
//!
//! Protects and accelerates calls to unreliable downstream services.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         AdvancedCache                            │
//! │   stampede lock · stale-while-revalidate · write-through/behind  │
//! │   multi-level (L1/L2) · breaker-wrapped access                   │
//! ├─────────────────────────────┬───────────────────────────────────┤
//! │        CacheManager         │          CircuitBreaker            │
//! │  (strategy routing, typed   │  (CLOSED → OPEN → HALF_OPEN,       │
//! │   helpers, neutral errors)  │   lazy recovery, listeners)        │
//! ├─────────────────────────────┴───────────────────────────────────┤
//! │   Store: InProcessStore | DistributedStore                       │
//! │     optionally wrapped by CompressedStore / PartitionedStore     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`breaker`] - Circuit breaker, listeners and registry
//! - [`cache`] - Stores, decorators and the cache manager
//! - [`config`] - YAML configuration
//! - [`context`] - Application context wiring everything together
//! - [`coordinator`] - Advanced cache access patterns
//! - [`error`] - Error types
//! - [`monitoring`] - Prometheus metrics and health reporting

pub mod breaker;
pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod monitoring;

pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, CircuitBreaker, CircuitState};
pub use cache::{CacheManager, Store, StrategyKind};
pub use config::BulwarkConfig;
pub use context::Bulwark;
pub use coordinator::{AdvancedCache, CoordinatorConfig, GuardedOptions};
pub use error::{Error, Result};
