//! Key Partitioning
//!
//! Maps keys onto a fixed set of store instances.
//!
//! # Strategies
//!
//! | Strategy          | Mapping                                              |
//! |-------------------|------------------------------------------------------|
//! | `hash`            | `hash(key) % N`                                      |
//! | `consistent-hash` | first virtual node on the ring with hash ≥ hash(key) |
//! | `range`           | first byte of the key split into N equal bands       |
//! | `round-robin`     | request order, not key dependent                     |
//!
//! # Consistent-hash ring
//!
//! ```text
//!            0 ─────────────── hash space ─────────────── u64::MAX
//!   ring:    │ a#17 │ c#3 │ b#88 │ a#2 │ ... │ c#149 │ b#0 │
//!   key ───────────────────▶ first node ≥ hash(key), wrapping to the start
//! ```
//!
//! Round-robin spreads load for a [`Partitioner`] user that does not need to
//! find a key again; [`PartitionedStore`] refuses it since reads and deletes
//! would land on a different instance than the write.
//!
//! Membership changes rebuild the ring. Moving data is never automatic:
//! [`Partitioner::plan_migration`] lists affected keys and
//! [`PartitionedStore::migrate`] executes a plan on demand.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::store::{Store, StoreStats};
use crate::error::{Error, Result};

// =============================================================================
// Strategy & Configuration
// =============================================================================

/// Partitioning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Modulo of the key hash
    Hash,
    /// Virtual-node hash ring
    #[default]
    ConsistentHash,
    /// Lexicographic bands over the first key byte
    Range,
    /// Rotate through instances per request
    RoundRobin,
}

impl PartitionStrategy {
    /// Configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionStrategy::Hash => "hash",
            PartitionStrategy::ConsistentHash => "consistent-hash",
            PartitionStrategy::Range => "range",
            PartitionStrategy::RoundRobin => "round-robin",
        }
    }

    /// Same key always maps to the same instance
    pub fn is_key_addressable(&self) -> bool {
        !matches!(self, PartitionStrategy::RoundRobin)
    }
}

impl FromStr for PartitionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hash" => Ok(PartitionStrategy::Hash),
            "consistent-hash" => Ok(PartitionStrategy::ConsistentHash),
            "range" => Ok(PartitionStrategy::Range),
            "round-robin" => Ok(PartitionStrategy::RoundRobin),
            other => Err(Error::Config(format!(
                "unknown partition strategy '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partitioning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Shard the store across instances
    pub enabled: bool,
    /// Key-to-instance strategy
    pub strategy: PartitionStrategy,
    /// Number of instances
    pub instances: usize,
    /// Ring entries per instance (consistent-hash only)
    pub virtual_nodes: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: PartitionStrategy::ConsistentHash,
            instances: 4,
            virtual_nodes: 150,
        }
    }
}

// =============================================================================
// Hashing
// =============================================================================

/// FxHash over bytes
#[inline]
fn fx_hash(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    hash
}

/// Murmur3 finalizer, spreads FxHash output across the full ring
#[inline]
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

#[inline]
fn key_hash(key: &str) -> u64 {
    fmix64(fx_hash(key.as_bytes()))
}

// =============================================================================
// Partitioner
// =============================================================================

/// A key whose owning instance changes between two partitioners
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Migration {
    pub key: String,
    pub from: String,
    pub to: String,
}

/// Deterministic key-to-instance mapping
pub struct Partitioner {
    strategy: PartitionStrategy,
    instances: Vec<String>,
    virtual_nodes: usize,
    /// Sorted (hash, instance index) pairs
    ring: Vec<(u64, usize)>,
    next: AtomicUsize,
}

impl Partitioner {
    /// Build a partitioner over named instances
    pub fn new(
        strategy: PartitionStrategy,
        instances: Vec<String>,
        virtual_nodes: usize,
    ) -> Result<Self> {
        if instances.is_empty() {
            return Err(Error::Config(
                "partitioner requires at least one instance".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = instances.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(Error::Config(format!("duplicate partition instance '{}'", dup)));
        }

        let virtual_nodes = virtual_nodes.max(1);
        let ring = match strategy {
            PartitionStrategy::ConsistentHash => build_ring(&instances, virtual_nodes),
            _ => Vec::new(),
        };

        Ok(Self {
            strategy,
            instances,
            virtual_nodes,
            ring,
            next: AtomicUsize::new(0),
        })
    }

    /// Partitioner over instances named `partition-0..n`
    pub fn with_count(strategy: PartitionStrategy, count: usize, virtual_nodes: usize) -> Result<Self> {
        Self::new(
            strategy,
            (0..count).map(|i| format!("partition-{}", i)).collect(),
            virtual_nodes,
        )
    }

    /// Strategy in use
    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Instance ids in index order
    pub fn instances(&self) -> &[String] {
        &self.instances
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Always false; a partitioner has at least one instance
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Ring size (consistent-hash only)
    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// Instance index owning `key`
    pub fn partition_for(&self, key: &str) -> usize {
        let n = self.instances.len();
        match self.strategy {
            PartitionStrategy::Hash => (key_hash(key) % n as u64) as usize,
            PartitionStrategy::ConsistentHash => {
                let hash = key_hash(key);
                let idx = self.ring.partition_point(|(h, _)| *h < hash);
                let (_, instance) = self.ring.get(idx).unwrap_or(&self.ring[0]);
                *instance
            }
            PartitionStrategy::Range => {
                let first = key.as_bytes().first().copied().unwrap_or(0) as usize;
                first * n / 256
            }
            PartitionStrategy::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    /// Instance id owning `key`
    pub fn owner(&self, key: &str) -> &str {
        &self.instances[self.partition_for(key)]
    }

    /// Copy with an extra instance
    pub fn with_instance_added(&self, id: impl Into<String>) -> Result<Self> {
        let mut instances = self.instances.clone();
        instances.push(id.into());
        Self::new(self.strategy, instances, self.virtual_nodes)
    }

    /// Copy without the given instance
    pub fn with_instance_removed(&self, id: &str) -> Result<Self> {
        if !self.instances.iter().any(|i| i == id) {
            return Err(Error::Config(format!("unknown partition instance '{}'", id)));
        }
        let instances = self
            .instances
            .iter()
            .filter(|i| i.as_str() != id)
            .cloned()
            .collect();
        Self::new(self.strategy, instances, self.virtual_nodes)
    }

    /// Keys whose owner differs under `next`
    ///
    /// Round-robin has no stable owner, so its plan is always empty.
    pub fn plan_migration<I, S>(&self, keys: I, next: &Partitioner) -> Vec<Migration>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.strategy == PartitionStrategy::RoundRobin
            || next.strategy == PartitionStrategy::RoundRobin
        {
            return Vec::new();
        }

        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                let from = self.owner(key);
                let to = next.owner(key);
                (from != to).then(|| Migration {
                    key: key.to_string(),
                    from: from.to_string(),
                    to: to.to_string(),
                })
            })
            .collect()
    }
}

fn build_ring(instances: &[String], virtual_nodes: usize) -> Vec<(u64, usize)> {
    let mut ring: Vec<(u64, usize)> = instances
        .iter()
        .enumerate()
        .flat_map(|(idx, id)| (0..virtual_nodes).map(move |v| (key_hash(&format!("{}#{}", id, v)), idx)))
        .collect();
    ring.sort_unstable();
    ring
}

impl Clone for Partitioner {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy,
            instances: self.instances.clone(),
            virtual_nodes: self.virtual_nodes,
            ring: self.ring.clone(),
            next: AtomicUsize::new(self.next.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for Partitioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partitioner")
            .field("strategy", &self.strategy)
            .field("instances", &self.instances)
            .field("virtual_nodes", &self.virtual_nodes)
            .field("ring_len", &self.ring.len())
            .finish()
    }
}

// =============================================================================
// Partitioned Store
// =============================================================================

/// Outcome of [`PartitionedStore::migrate`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Keys copied to their new owner
    pub moved: usize,
    /// Keys no longer present at the source
    pub missing: usize,
    /// Keys that could not be moved
    pub failed: usize,
}

struct PartitionState {
    partitioner: Arc<Partitioner>,
    stores: Vec<Arc<dyn Store>>,
    /// Removed instances kept readable until their keys are migrated
    retired: Vec<(String, Arc<dyn Store>)>,
}

impl PartitionState {
    fn lookup(&self, id: &str) -> Option<Arc<dyn Store>> {
        self.partitioner
            .instances()
            .iter()
            .position(|i| i == id)
            .map(|idx| self.stores[idx].clone())
            .or_else(|| {
                self.retired
                    .iter()
                    .find(|(rid, _)| rid == id)
                    .map(|(_, s)| s.clone())
            })
    }
}

/// Store decorator routing each key to one of several stores
pub struct PartitionedStore {
    state: RwLock<PartitionState>,
}

impl PartitionedStore {
    /// Route over `stores`, one per partitioner instance
    pub fn new(partitioner: Partitioner, stores: Vec<Arc<dyn Store>>) -> Result<Self> {
        if !partitioner.strategy().is_key_addressable() {
            return Err(Error::Config(format!(
                "partition strategy '{}' cannot back a store",
                partitioner.strategy()
            )));
        }
        if partitioner.len() != stores.len() {
            return Err(Error::Config(format!(
                "partitioner has {} instances but {} stores were supplied",
                partitioner.len(),
                stores.len()
            )));
        }
        Ok(Self {
            state: RwLock::new(PartitionState {
                partitioner: Arc::new(partitioner),
                stores,
                retired: Vec::new(),
            }),
        })
    }

    /// Current partitioner
    pub fn partitioner(&self) -> Arc<Partitioner> {
        self.state.read().partitioner.clone()
    }

    /// Store owning `key`
    pub fn store_for(&self, key: &str) -> Arc<dyn Store> {
        let state = self.state.read();
        let idx = state.partitioner.partition_for(key);
        state.stores[idx].clone()
    }

    /// Add an instance and rebuild the mapping; existing keys are not moved
    pub fn add_instance(&self, id: impl Into<String>, store: Arc<dyn Store>) -> Result<Arc<Partitioner>> {
        let id = id.into();
        let mut state = self.state.write();
        let next = Arc::new(state.partitioner.with_instance_added(id.clone())?);
        state.partitioner = next.clone();
        state.stores.push(store);
        tracing::info!(instance = %id, instances = next.len(), "Added cache partition");
        Ok(next)
    }

    /// Remove an instance; its store stays readable for [`Self::migrate`]
    pub fn remove_instance(&self, id: &str) -> Result<Arc<Partitioner>> {
        let mut state = self.state.write();
        let next = Arc::new(state.partitioner.with_instance_removed(id)?);
        let idx = state
            .partitioner
            .instances()
            .iter()
            .position(|i| i == id)
            .ok_or_else(|| Error::Internal(format!("partition '{}' vanished", id)))?;
        let store = state.stores.remove(idx);
        state.retired.push((id.to_string(), store));
        state.partitioner = next.clone();
        tracing::info!(instance = %id, instances = next.len(), "Removed cache partition");
        Ok(next)
    }

    /// Drop retired stores once their keys have been migrated
    pub fn release_retired(&self) -> usize {
        let mut state = self.state.write();
        let released = state.retired.len();
        state.retired.clear();
        released
    }

    /// Move planned keys to their new owners, writing them with `ttl`
    pub async fn migrate(&self, plan: &[Migration], ttl: Duration) -> MigrationReport {
        let mut report = MigrationReport::default();

        for migration in plan {
            let (source, target) = {
                let state = self.state.read();
                (state.lookup(&migration.from), state.lookup(&migration.to))
            };
            let (Some(source), Some(target)) = (source, target) else {
                tracing::warn!(key = %migration.key, from = %migration.from, to = %migration.to, "Migration endpoint not found");
                report.failed += 1;
                continue;
            };

            let moved = async {
                match source.get(&migration.key).await? {
                    Some(value) => {
                        target.set(&migration.key, value, ttl).await?;
                        source.delete(&migration.key).await?;
                        Ok::<_, Error>(true)
                    }
                    None => Ok(false),
                }
            }
            .await;

            match moved {
                Ok(true) => report.moved += 1,
                Ok(false) => report.missing += 1,
                Err(e) => {
                    tracing::warn!(key = %migration.key, error = %e, "Failed to migrate key");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(moved = report.moved, missing = report.missing, failed = report.failed, "Partition migration finished");
        report
    }

    fn all_stores(&self) -> Vec<Arc<dyn Store>> {
        let state = self.state.read();
        state
            .stores
            .iter()
            .cloned()
            .chain(state.retired.iter().map(|(_, s)| s.clone()))
            .collect()
    }
}

impl std::fmt::Debug for PartitionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PartitionedStore")
            .field("partitioner", &state.partitioner)
            .field("retired", &state.retired.len())
            .finish()
    }
}

#[async_trait]
impl Store for PartitionedStore {
    fn name(&self) -> &str {
        "partitioned"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.store_for(key).get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        self.store_for(key).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.store_for(key).delete(key).await
    }

    async fn clear(&self) -> Result<bool> {
        let mut cleared = true;
        for store in self.all_stores() {
            cleared &= store.clear().await?;
        }
        Ok(cleared)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.store_for(key).exists(key).await
    }

    fn stats(&self) -> StoreStats {
        let parts: Vec<StoreStats> = self.state.read().stores.iter().map(|s| s.stats()).collect();
        StoreStats::merged("partitioned", &parts)
    }

    async fn is_healthy(&self) -> bool {
        for store in self.all_stores() {
            if !store.is_healthy().await {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
