//! Cache Manager
//!
//! Routes cache operations to the selected store strategy.
//!
//! Backend failures never reach the caller: reads degrade to a miss and
//! writes to `false`, with the failure logged and counted. The round-trip
//! [`CacheManager::health_check`] is where failures surface.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entry::Timestamped;
use super::memory::InProcessStore;
use super::store::{Store, StoreStats};
use crate::error::{Error, Result};
use crate::monitoring::BulwarkMetrics;

// =============================================================================
// Strategy
// =============================================================================

/// Store strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Process-local map
    #[default]
    InProcess,
    /// External key-value service
    Distributed,
}

impl StrategyKind {
    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::InProcess => "in-process",
            StrategyKind::Distributed => "distributed",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-process" | "memory" => Ok(StrategyKind::InProcess),
            "distributed" | "redis" => Ok(StrategyKind::Distributed),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Health
// =============================================================================

/// Result of a round-trip probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHealth {
    /// Set, get and delete all succeeded and the value round-tripped
    pub healthy: bool,
    /// Strategy that was exercised
    pub strategy: StrategyKind,
    /// Backend name of that strategy
    pub backend: String,
    /// Probe duration
    pub latency_ms: u64,
    /// Failure description when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Cache Manager
// =============================================================================

/// Strategy-routing cache facade
pub struct CacheManager {
    stores: HashMap<StrategyKind, Arc<dyn Store>>,
    current: RwLock<(StrategyKind, Arc<dyn Store>)>,
    default_ttl: Duration,
    metrics: Option<BulwarkMetrics>,
}

impl CacheManager {
    /// Create with the in-process strategy registered and selected
    pub fn new(default_ttl: Duration) -> Self {
        let memory: Arc<dyn Store> = Arc::new(InProcessStore::new());
        let mut stores: HashMap<StrategyKind, Arc<dyn Store>> = HashMap::new();
        stores.insert(StrategyKind::InProcess, memory.clone());
        Self {
            stores,
            current: RwLock::new((StrategyKind::InProcess, memory)),
            default_ttl,
            metrics: None,
        }
    }

    /// Register (or replace) the store for a strategy
    pub fn with_store(mut self, kind: StrategyKind, store: Arc<dyn Store>) -> Self {
        {
            let current = self.current.get_mut();
            if current.0 == kind {
                current.1 = store.clone();
            }
        }
        self.stores.insert(kind, store);
        self
    }

    /// Record operations into `metrics`
    pub fn with_metrics(mut self, metrics: BulwarkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// TTL used when callers pass `None`
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    // -------------------------------------------------------------------------
    // Strategy selection
    // -------------------------------------------------------------------------

    /// Selected strategy
    pub fn current_strategy(&self) -> StrategyKind {
        self.current.read().0
    }

    /// Registered strategies, sorted
    pub fn registered_strategies(&self) -> Vec<StrategyKind> {
        let mut kinds: Vec<StrategyKind> = self.stores.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Switch strategy; later operations go to the new store
    pub fn set_strategy(&self, kind: StrategyKind) -> Result<()> {
        let store = self
            .stores
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy(kind.to_string()))?;
        let (previous, _) = std::mem::replace(&mut *self.current.write(), (kind, store));
        if previous != kind {
            info!(from = %previous, to = %kind, "Switched cache strategy");
        }
        Ok(())
    }

    /// Switch strategy by configuration name
    pub fn set_strategy_by_name(&self, name: &str) -> Result<()> {
        self.set_strategy(name.parse()?)
    }

    /// Store registered for a strategy
    pub fn store(&self, kind: StrategyKind) -> Option<Arc<dyn Store>> {
        self.stores.get(&kind).cloned()
    }

    /// Store of the selected strategy
    pub fn current_store(&self) -> Arc<dyn Store> {
        self.current.read().1.clone()
    }

    // -------------------------------------------------------------------------
    // Byte-level operations
    // -------------------------------------------------------------------------

    /// Raw bytes from the selected store
    pub async fn get_bytes(&self, key: &str) -> Option<Bytes> {
        self.get_bytes_from(&self.current_store(), key).await
    }

    /// Raw bytes into the selected store; `None` ttl uses the default
    pub async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> bool {
        self.set_bytes_in(&self.current_store(), key, value, ttl).await
    }

    /// Remove a key from the selected store
    pub async fn delete(&self, key: &str) -> bool {
        self.delete_in(&self.current_store(), key).await
    }

    /// Remove a key from a specific strategy's store
    pub async fn delete_from(&self, kind: StrategyKind, key: &str) -> bool {
        match self.store(kind) {
            Some(store) => self.delete_in(&store, key).await,
            None => false,
        }
    }

    /// Wipe the selected store
    pub async fn clear(&self) -> bool {
        let store = self.current_store();
        match store.clear().await {
            Ok(cleared) => {
                self.record("clear", "ok");
                cleared
            }
            Err(e) => {
                warn!(backend = store.name(), error = %e, "Cache clear failed");
                self.record("clear", "error");
                false
            }
        }
    }

    /// Check for a live key in the selected store
    pub async fn exists(&self, key: &str) -> bool {
        let store = self.current_store();
        match store.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(backend = store.name(), key, error = %e, "Cache exists check failed");
                false
            }
        }
    }

    async fn get_bytes_from(&self, store: &Arc<dyn Store>, key: &str) -> Option<Bytes> {
        match store.get(key).await {
            Ok(Some(value)) => {
                self.record("get", "hit");
                Some(value)
            }
            Ok(None) => {
                self.record("get", "miss");
                None
            }
            Err(e) => {
                warn!(backend = store.name(), key, error = %e, "Cache get failed, treating as miss");
                self.record("get", "error");
                None
            }
        }
    }

    async fn set_bytes_in(
        &self,
        store: &Arc<dyn Store>,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> bool {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match store.set(key, value, ttl).await {
            Ok(stored) => {
                self.record("set", "ok");
                stored
            }
            Err(e) => {
                warn!(backend = store.name(), key, error = %e, "Cache set failed");
                self.record("set", "error");
                false
            }
        }
    }

    async fn delete_in(&self, store: &Arc<dyn Store>, key: &str) -> bool {
        match store.delete(key).await {
            Ok(deleted) => {
                self.record("delete", "ok");
                deleted
            }
            Err(e) => {
                warn!(backend = store.name(), key, error = %e, "Cache delete failed");
                self.record("delete", "error");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Typed operations
    // -------------------------------------------------------------------------

    /// Typed value from the selected store
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key).await?;
        self.decode(key, &bytes)
    }

    /// Typed value into the selected store
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match encode(value) {
            Ok(bytes) => self.set_bytes(key, bytes, ttl).await,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize cache value");
                false
            }
        }
    }

    /// Typed value from a specific strategy's store
    pub async fn get_from<T: DeserializeOwned>(&self, kind: StrategyKind, key: &str) -> Option<T> {
        let store = self.store(kind)?;
        let bytes = self.get_bytes_from(&store, key).await?;
        self.decode(key, &bytes)
    }

    /// Typed value into a specific strategy's store
    pub async fn set_in<T: Serialize + ?Sized>(
        &self,
        kind: StrategyKind,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let Some(store) = self.store(kind) else {
            return false;
        };
        match encode(value) {
            Ok(bytes) => self.set_bytes_in(&store, key, bytes, ttl).await,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize cache value");
                false
            }
        }
    }

    /// Value stored together with its write time
    pub async fn get_with_metadata<T: DeserializeOwned>(&self, key: &str) -> Option<Timestamped<T>> {
        self.get(key).await
    }

    /// Store a value stamped with the current time
    pub async fn set_with_metadata<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        self.set(key, &Timestamped::now(value), ttl).await
    }

    fn decode<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Option<T> {
        match decode(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cached value has unexpected shape, treating as miss");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    /// Statistics of the selected store
    pub fn stats(&self) -> StoreStats {
        self.current_store().stats()
    }

    /// Round-trip a throwaway key through the selected store
    pub async fn health_check(&self) -> CacheHealth {
        let (strategy, store) = self.current.read().clone();
        let start = Instant::now();

        let key = format!("__health__:{}", uuid::Uuid::new_v4());
        let probe = Bytes::from_static(b"ok");
        let result = async {
            store.set(&key, probe.clone(), Duration::from_secs(10)).await?;
            let read = store.get(&key).await?;
            store.delete(&key).await?;
            match read {
                Some(value) if value == probe => Ok(()),
                Some(_) => Err(Error::Internal("probe value mismatch".into())),
                None => Err(Error::Internal("probe value not readable".into())),
            }
        }
        .await;

        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                debug!(strategy = %strategy, latency_ms, "Cache health check passed");
                CacheHealth {
                    healthy: true,
                    strategy,
                    backend: store.name().to_string(),
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                warn!(strategy = %strategy, error = %e, "Cache health check failed");
                CacheHealth {
                    healthy: false,
                    strategy,
                    backend: store.name().to_string(),
                    latency_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn record(&self, op: &str, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_op(op, result);
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("strategies", &self.registered_strategies())
            .field("current", &self.current_strategy())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::distributed::{DistributedStore, InMemoryRemote};
    use assert_matches::assert_matches;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn manager() -> (Arc<InMemoryRemote>, CacheManager) {
        let remote = Arc::new(InMemoryRemote::new());
        let manager = CacheManager::new(Duration::from_secs(300)).with_store(
            StrategyKind::Distributed,
            Arc::new(DistributedStore::new(remote.clone(), "test:")),
        );
        (remote, manager)
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("in-process".parse::<StrategyKind>().unwrap(), StrategyKind::InProcess);
        assert_eq!("memory".parse::<StrategyKind>().unwrap(), StrategyKind::InProcess);
        assert_eq!("redis".parse::<StrategyKind>().unwrap(), StrategyKind::Distributed);
        assert_matches!("memcached".parse::<StrategyKind>(), Err(Error::UnknownStrategy(name)) if name == "memcached");
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let (_, manager) = manager();
        let user = User {
            id: 1,
            name: "alice".into(),
        };

        assert!(manager.set("user:1", &user, None).await);
        assert_eq!(manager.get::<User>("user:1").await, Some(user));
        assert!(manager.exists("user:1").await);

        assert!(manager.delete("user:1").await);
        assert_eq!(manager.get::<User>("user:1").await, None);
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected() {
        let manager = CacheManager::new(Duration::from_secs(60));
        assert_eq!(manager.registered_strategies(), vec![StrategyKind::InProcess]);
        assert_matches!(
            manager.set_strategy(StrategyKind::Distributed),
            Err(Error::UnknownStrategy(_))
        );
        assert_matches!(manager.set_strategy_by_name("nope"), Err(Error::UnknownStrategy(_)));
        assert_eq!(manager.current_strategy(), StrategyKind::InProcess);
    }

    #[tokio::test]
    async fn test_hot_swap_routes_new_operations() {
        let (_, manager) = manager();
        manager.set("k", &"local", None).await;

        manager.set_strategy_by_name("distributed").unwrap();
        assert_eq!(manager.current_strategy(), StrategyKind::Distributed);
        assert_eq!(manager.get::<String>("k").await, None);

        manager.set("k", &"remote", None).await;
        assert_eq!(manager.get::<String>("k").await.as_deref(), Some("remote"));
        assert_eq!(
            manager.get_from::<String>(StrategyKind::InProcess, "k").await.as_deref(),
            Some("local")
        );
    }

    #[tokio::test]
    async fn test_backend_outage_returns_neutral_values() {
        let (remote, manager) = manager();
        manager.set_strategy(StrategyKind::Distributed).unwrap();
        remote.set_available(false);

        assert_eq!(manager.get::<String>("k").await, None);
        assert!(!manager.set("k", &"v", None).await);
        assert!(!manager.delete("k").await);
        assert!(!manager.clear().await);
        assert!(!manager.exists("k").await);
    }

    #[tokio::test]
    async fn test_health_check() {
        let (remote, manager) = manager();
        let health = manager.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.strategy, StrategyKind::InProcess);
        assert_eq!(health.backend, "memory");

        manager.set_strategy(StrategyKind::Distributed).unwrap();
        remote.set_available(false);
        let health = manager.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.strategy, StrategyKind::Distributed);
        assert!(health.error.unwrap().contains("unavailable"));

        remote.set_available(true);
        assert!(manager.health_check().await.healthy);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let (_, manager) = manager();
        assert!(manager.set_with_metadata("k", &42u32, None).await);

        let stamped = manager.get_with_metadata::<u32>("k").await.unwrap();
        assert_eq!(stamped.value, 42);
        assert!(stamped.age() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_a_miss() {
        let (_, manager) = manager();
        manager.set("k", &"not a number", None).await;
        assert_eq!(manager.get::<u64>("k").await, None);
        assert_matches!(decode::<u64>(b"\"not a number\""), Err(Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_unserializable_value_is_not_stored() {
        let (_, manager) = manager();
        let mut tuple_keys = HashMap::new();
        tuple_keys.insert((1u8, 2u8), 3u8);

        assert_matches!(encode(&tuple_keys), Err(Error::Serialization(_)));
        assert!(!manager.set("k", &tuple_keys, None).await);
        assert!(!manager.exists("k").await);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let metrics = BulwarkMetrics::new().unwrap();
        let manager = CacheManager::new(Duration::from_secs(60)).with_metrics(metrics.clone());

        manager.set("k", &1, None).await;
        manager.get::<i32>("k").await;
        manager.get::<i32>("missing").await;

        assert_eq!(metrics.cache_op_count("set", "ok"), 1);
        assert_eq!(metrics.cache_op_count("get", "hit"), 1);
        assert_eq!(metrics.cache_op_count("get", "miss"), 1);
    }
}
