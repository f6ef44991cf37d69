//! Application Context
//!
//! [`Bulwark`] wires the cache strategies, coordinator, breaker registry and
//! metrics together from a [`BulwarkConfig`]. It is built once at startup and
//! handed to request handlers by cloning.

use std::sync::Arc;

use tracing::info;

use crate::breaker::{BreakerListener, BreakerRegistry, TracingListener};
use crate::cache::{
    CacheManager, CompressedStore, DistributedStore, InMemoryRemote, InProcessStore,
    PartitionedStore, Partitioner, RemoteBackend, Store, StrategyKind,
};
use crate::config::BulwarkConfig;
use crate::coordinator::AdvancedCache;
use crate::error::Result;
use crate::monitoring::{
    BulwarkMetrics, HealthCheckResult, HealthProbe, HealthResponse, MetricsListener,
};

/// Shared handle to every Bulwark component
#[derive(Clone)]
pub struct Bulwark {
    config: Arc<BulwarkConfig>,
    manager: Arc<CacheManager>,
    cache: AdvancedCache,
    breakers: Arc<BreakerRegistry>,
    metrics: BulwarkMetrics,
    probe: Arc<HealthProbe>,
}

impl Bulwark {
    /// Build every component described by `config`
    pub async fn from_config(config: BulwarkConfig) -> Result<Self> {
        config.validate()?;

        let metrics = BulwarkMetrics::new()?;
        let listeners: Vec<Arc<dyn BreakerListener>> = vec![
            Arc::new(TracingListener),
            Arc::new(MetricsListener::new(metrics.clone())),
        ];

        let remote = connect_remote(&config).await?;
        let in_process = build_store(&config, StrategyKind::InProcess, &remote)?;
        let distributed = build_store(&config, StrategyKind::Distributed, &remote)?;

        let manager = CacheManager::new(config.default_ttl())
            .with_store(StrategyKind::InProcess, in_process)
            .with_store(StrategyKind::Distributed, distributed)
            .with_metrics(metrics.clone());
        manager.set_strategy(config.cache.default_strategy)?;
        let manager = Arc::new(manager);

        let breakers = listeners
            .iter()
            .cloned()
            .fold(BreakerRegistry::new(config.breaker_config()), |registry, l| {
                registry.with_listener(l)
            });

        let cache = AdvancedCache::with_observability(
            manager.clone(),
            config.coordinator_config(),
            listeners,
            Some(metrics.clone()),
        );

        let probe = HealthProbe::new();
        probe.set_ready(true);

        info!(
            strategy = %config.cache.default_strategy,
            compression = config.cache.compression.enabled,
            partitioning = config.cache.partition.enabled,
            "Bulwark context initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            manager,
            cache,
            breakers: Arc::new(breakers),
            metrics,
            probe: Arc::new(probe),
        })
    }

    pub fn config(&self) -> &BulwarkConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Advanced access patterns
    pub fn cache(&self) -> &AdvancedCache {
        &self.cache
    }

    /// Named breakers for downstream calls
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn metrics(&self) -> &BulwarkMetrics {
        &self.metrics
    }

    pub fn probe(&self) -> &HealthProbe {
        &self.probe
    }

    /// Cache round-trip probe, every named breaker's state and a summary of
    /// the per-key cache breakers
    pub async fn health(&self) -> HealthResponse {
        let mut checks = vec![
            self.probe.liveness_check(),
            HealthCheckResult::from_cache(&self.manager.health_check().await),
        ];
        checks.extend(
            self.breakers
                .all_metrics()
                .iter()
                .map(HealthCheckResult::from_breaker),
        );
        checks.push(HealthCheckResult::from_key_breakers(
            &self.cache.key_breaker_metrics(),
        ));
        HealthResponse::new(checks, self.probe.uptime())
    }

    /// Stop accepting traffic and wait for background work to finish
    pub async fn shutdown(&self) {
        self.probe.set_ready(false);
        info!(
            pending = self.cache.background_tasks(),
            "Draining background cache tasks"
        );
        self.cache.wait_for_background().await;
        self.probe.set_live(false);
    }
}

impl std::fmt::Debug for Bulwark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulwark")
            .field("strategy", &self.manager.current_strategy())
            .field("cache", &self.cache)
            .field("breakers", &self.breakers.names())
            .finish()
    }
}

#[cfg(feature = "redis")]
async fn connect_remote(config: &BulwarkConfig) -> Result<Arc<dyn RemoteBackend>> {
    match &config.cache.distributed.url {
        Some(url) => {
            let remote = crate::cache::RedisRemote::connect(url).await?;
            info!(url = %url, "Connected distributed cache backend");
            Ok(Arc::new(remote))
        }
        None => Ok(Arc::new(InMemoryRemote::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn connect_remote(config: &BulwarkConfig) -> Result<Arc<dyn RemoteBackend>> {
    if let Some(url) = &config.cache.distributed.url {
        tracing::warn!(
            url = %url,
            "Distributed cache URL ignored; built without the redis feature, using in-memory backend"
        );
    }
    Ok(Arc::new(InMemoryRemote::new()))
}

/// Base store for `kind`, sharded and compressed as configured
fn build_store(
    config: &BulwarkConfig,
    kind: StrategyKind,
    remote: &Arc<dyn RemoteBackend>,
) -> Result<Arc<dyn Store>> {
    let prefix = &config.cache.distributed.key_prefix;
    let partition = &config.cache.partition;

    let store: Arc<dyn Store> = if partition.enabled {
        let partitioner =
            Partitioner::with_count(partition.strategy, partition.instances, partition.virtual_nodes)?;
        let shards = partitioner
            .instances()
            .iter()
            .map(|id| -> Arc<dyn Store> {
                match kind {
                    StrategyKind::InProcess => Arc::new(InProcessStore::named(format!("memory:{}", id))),
                    StrategyKind::Distributed => {
                        Arc::new(DistributedStore::new(remote.clone(), format!("{}{}:", prefix, id)))
                    }
                }
            })
            .collect();
        Arc::new(PartitionedStore::new(partitioner, shards)?)
    } else {
        match kind {
            StrategyKind::InProcess => Arc::new(InProcessStore::new()),
            StrategyKind::Distributed => Arc::new(DistributedStore::new(remote.clone(), prefix.clone())),
        }
    };

    if config.cache.compression.enabled {
        Ok(Arc::new(CompressedStore::new(store, config.cache.compression.clone())))
    } else {
        Ok(store)
    }
}

// =============================================================================
// Tests
// =============================================================================
