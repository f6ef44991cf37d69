//! Distributed Store
//!
//! Cache strategy backed by an external key-value service.
//!
//! # Design
//!
//! - [`RemoteBackend`] is the narrow client seam (get / set with expiry /
//!   delete / prefix clear / ping)
//! - [`DistributedStore`] namespaces keys, counts hits and misses, and maps
//!   every client failure to [`Error::BackendUnavailable`]
//! - [`InMemoryRemote`] stands in for the service locally and in tests; it can
//!   be switched offline to simulate an outage
//! - `RedisRemote` (feature `redis`) talks to a real Redis server

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use super::store::{Store, StoreCounters, StoreStats};
use crate::error::{Error, Result};

/// Client for an external key-value service
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Endpoint description for logs
    fn endpoint(&self) -> &str;

    /// Fetch raw bytes
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes; zero `ttl` means no expiry
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key starting with `prefix`, returning the count removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Round-trip connectivity check
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// In-Memory Remote
// =============================================================================

/// Local stand-in for a remote key-value service
pub struct InMemoryRemote {
    data: DashMap<String, (Vec<u8>, Option<Instant>)>,
    available: AtomicBool,
}

impl InMemoryRemote {
    /// Create an empty, reachable remote
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the service going offline or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys held, including expired ones not yet reaped
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop `key` only if the entry present now is still expired
    fn reap_expired(&self, key: &str, now: Instant) -> bool {
        self.data
            .remove_if(key, |_, (_, deadline)| is_expired(*deadline, now))
            .is_some()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::backend(self.endpoint(), "connection refused"))
        }
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(deadline: Option<Instant>, now: Instant) -> bool {
    matches!(deadline, Some(deadline) if now >= deadline)
}

#[async_trait]
impl RemoteBackend for InMemoryRemote {
    fn endpoint(&self) -> &str {
        "memory://remote"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;

        let now = Instant::now();
        match self.data.get(key) {
            Some(entry) if !is_expired(entry.1, now) => return Ok(Some(entry.0.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        // A concurrent set may have replaced the entry since the read
        self.reap_expired(key, now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        let deadline = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.data.insert(key.to_string(), (value.to_vec(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.data.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.ensure_available()?;
        let before = self.data.len();
        self.data.retain(|k, _| !k.starts_with(prefix));
        Ok((before - self.data.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }
}

// =============================================================================
// Redis Remote
// =============================================================================

#[cfg(feature = "redis")]
pub use self::redis_remote::RedisRemote;

#[cfg(feature = "redis")]
mod redis_remote {
    use super::*;
    use redis::AsyncCommands;

    /// Redis client using a self-reconnecting connection manager
    pub struct RedisRemote {
        url: String,
        conn: redis::aio::ConnectionManager,
    }

    impl RedisRemote {
        /// Connect to the Redis server at `url`
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url).map_err(|e| Error::backend(url, e))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|e| Error::backend(url, e))?;
            tracing::info!(url, "Connected to Redis");
            Ok(Self {
                url: url.to_string(),
                conn,
            })
        }

        fn fail(&self, err: redis::RedisError) -> Error {
            Error::backend(&self.url, err)
        }
    }

    #[async_trait]
    impl RemoteBackend for RedisRemote {
        fn endpoint(&self) -> &str {
            &self.url
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let mut conn = self.conn.clone();
            conn.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(|e| self.fail(e))
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let result = if ttl.is_zero() {
                conn.set::<_, _, ()>(key, value).await
            } else {
                let millis = ttl.as_millis().max(1) as u64;
                conn.pset_ex::<_, _, ()>(key, value, millis).await
            };
            result.map_err(|e| self.fail(e))
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            let mut conn = self.conn.clone();
            let removed: i64 = conn.del(key).await.map_err(|e| self.fail(e))?;
            Ok(removed > 0)
        }

        async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn
                .keys(format!("{}*", prefix))
                .await
                .map_err(|e| self.fail(e))?;
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: u64 = conn.del(keys).await.map_err(|e| self.fail(e))?;
            Ok(removed)
        }

        async fn ping(&self) -> Result<()> {
            let mut conn = self.conn.clone();
            let _: bool = conn
                .exists("bulwark:ping")
                .await
                .map_err(|e| self.fail(e))?;
            Ok(())
        }
    }
}

// =============================================================================
// Distributed Store
// =============================================================================

/// Store strategy backed by a [`RemoteBackend`]
pub struct DistributedStore {
    name: String,
    prefix: String,
    remote: Arc<dyn RemoteBackend>,
    counters: StoreCounters,
}

impl DistributedStore {
    /// Create a store writing keys under `prefix`
    pub fn new(remote: Arc<dyn RemoteBackend>, prefix: impl Into<String>) -> Self {
        Self {
            name: "distributed".to_string(),
            prefix: prefix.into(),
            remote,
            counters: StoreCounters::new(),
        }
    }

    /// Create over a fresh [`InMemoryRemote`]
    pub fn in_memory(prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemoryRemote::new()), prefix)
    }

    /// Key namespace
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Underlying client
    pub fn remote(&self) -> &Arc<dyn RemoteBackend> {
        &self.remote
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn unavailable(&self, err: Error) -> Error {
        match err {
            Error::BackendUnavailable { .. } => err,
            other => Error::backend(&self.name, other),
        }
    }
}

#[async_trait]
impl Store for DistributedStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let result = self
            .remote
            .get(&self.namespaced(key))
            .await
            .map_err(|e| self.unavailable(e))?
            .map(Bytes::from);
        self.counters.record_lookup(&result);
        Ok(result)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        self.remote
            .set(&self.namespaced(key), &value, ttl)
            .await
            .map_err(|e| self.unavailable(e))?;
        self.counters.record_set();
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.counters.record_delete();
        self.remote
            .delete(&self.namespaced(key))
            .await
            .map_err(|e| self.unavailable(e))
    }

    async fn clear(&self) -> Result<bool> {
        let removed = self
            .remote
            .delete_prefix(&self.prefix)
            .await
            .map_err(|e| self.unavailable(e))?;
        tracing::debug!(prefix = %self.prefix, removed, "Cleared distributed cache namespace");
        Ok(true)
    }

    fn stats(&self) -> StoreStats {
        // Entry count is not tracked remotely
        self.counters.snapshot(&self.name, 0)
    }

    async fn is_healthy(&self) -> bool {
        match self.remote.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(endpoint = self.remote.endpoint(), error = %e, "Distributed cache ping failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for DistributedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedStore")
            .field("prefix", &self.prefix)
            .field("endpoint", &self.remote.endpoint())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
