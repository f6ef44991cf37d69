//! Configuration
//!
//! `BulwarkConfig` is loaded once at startup from YAML. Every section and
//! field has a default, so an empty document is a valid configuration.
//!
//! ```yaml
//! cache:
//!   default_strategy: distributed
//!   default_ttl_secs: 300
//!   distributed:
//!     key_prefix: "orders:"
//!   compression:
//!     enabled: true
//!     threshold_bytes: 2048
//!   partition:
//!     enabled: true
//!     strategy: consistent-hash
//!     instances: 8
//! breaker:
//!   failure_threshold: 5
//!   recovery_timeout_ms: 60000
//! coordinator:
//!   lock_timeout_ms: 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::cache::compression::CompressionConfig;
use crate::cache::partition::PartitionConfig;
use crate::cache::{StrategyKind, DEFAULT_KEY_PREFIX};
use crate::coordinator::CoordinatorConfig;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulwarkConfig {
    pub cache: CacheSection,
    pub breaker: BreakerSection,
    pub coordinator: CoordinatorSection,
}

/// `cache` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Strategy selected at startup
    pub default_strategy: StrategyKind,
    /// TTL applied when callers do not pass one
    pub default_ttl_secs: u64,
    pub distributed: DistributedSection,
    pub compression: CompressionConfig,
    pub partition: PartitionConfig,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_strategy: StrategyKind::InProcess,
            default_ttl_secs: 300,
            distributed: DistributedSection::default(),
            compression: CompressionConfig::default(),
            partition: PartitionConfig::default(),
        }
    }
}

/// `cache.distributed` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedSection {
    /// Namespace prepended to every key
    pub key_prefix: String,
    /// Remote server URL; only honored when built with the `redis` feature
    pub url: Option<String>,
}

impl Default for DistributedSection {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            url: None,
        }
    }
}

/// `breaker` section, the defaults for named breakers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

/// `coordinator` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub write_delay_ms: u64,
    pub l1_ttl_secs: u64,
    pub key_breaker_idle_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            lock_poll_interval_ms: 50,
            write_delay_ms: 1_000,
            l1_ttl_secs: 60,
            key_breaker_idle_secs: 600,
        }
    }
}

impl BulwarkConfig {
    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.default_ttl_secs == 0 {
            return Err(Error::Config("cache.default_ttl_secs must be greater than 0".into()));
        }

        if self.cache.partition.enabled {
            if self.cache.partition.instances == 0 {
                return Err(Error::Config(
                    "cache.partition.instances must be greater than 0".into(),
                ));
            }
            if self.cache.partition.virtual_nodes == 0 {
                return Err(Error::Config(
                    "cache.partition.virtual_nodes must be greater than 0".into(),
                ));
            }
            if !self.cache.partition.strategy.is_key_addressable() {
                return Err(Error::Config(format!(
                    "cache.partition.strategy '{}' does not map a key to a fixed instance",
                    self.cache.partition.strategy
                )));
            }
        }

        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker.failure_threshold must be greater than 0".into()));
        }

        if self.coordinator.lock_poll_interval_ms == 0 {
            return Err(Error::Config(
                "coordinator.lock_poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.coordinator.lock_poll_interval_ms > self.coordinator.lock_timeout_ms {
            return Err(Error::Config(
                "coordinator.lock_poll_interval_ms must not exceed lock_timeout_ms".into(),
            ));
        }

        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::new(
            self.breaker.failure_threshold,
            Duration::from_millis(self.breaker.recovery_timeout_ms),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let c = &self.coordinator;
        CoordinatorConfig {
            lock_timeout: Duration::from_millis(c.lock_timeout_ms),
            lock_poll_interval: Duration::from_millis(c.lock_poll_interval_ms),
            write_delay: Duration::from_millis(c.write_delay_ms),
            l1_ttl: Duration::from_secs(c.l1_ttl_secs),
            key_breaker_idle: Duration::from_secs(c.key_breaker_idle_secs),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
