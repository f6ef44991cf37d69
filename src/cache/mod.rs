//! Cache Stores and Strategy Routing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            CacheManager                                   │
//! │                 (selected strategy, neutral returns)                      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │   StrategyKind::InProcess          │   StrategyKind::Distributed          │
//! │          │                         │          │                           │
//! │   [CompressedStore]                │   [CompressedStore]                  │
//! │          │                         │          │                           │
//! │   [PartitionedStore]               │   [PartitionedStore]                 │
//! │     │      │      │                │     │      │      │                  │
//! │  InProcessStore × N                │  DistributedStore ──▶ RemoteBackend  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Bracketed layers are optional decorators; every layer implements [`Store`].

pub mod compression;
pub mod distributed;
mod entry;
mod manager;
mod memory;
pub mod partition;
mod proptest;
mod store;

pub use compression::{
    CompressedStore, CompressionAlgorithm, CompressionCodec, CompressionConfig, CompressionStats,
};
#[cfg(feature = "redis")]
pub use distributed::RedisRemote;
pub use distributed::{DistributedStore, InMemoryRemote, RemoteBackend};
pub use entry::{CacheEntry, Timestamped};
pub use manager::{CacheHealth, CacheManager, StrategyKind};
pub use memory::InProcessStore;
pub use partition::{
    Migration, MigrationReport, PartitionConfig, PartitionStrategy, PartitionedStore, Partitioner,
};
pub use store::{Store, StoreCounters, StoreStats};

/// Key prefix used by the distributed strategy when none is configured
pub const DEFAULT_KEY_PREFIX: &str = "bulwark:";
