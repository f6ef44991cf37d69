//! Multi-Level Get and Set
//!
//! L1 is the in-process strategy, L2 the distributed one. An L2 hit is
//! promoted into L1 with the configured L1 TTL.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::AdvancedCache;
use crate::cache::StrategyKind;

/// Level that answered a multi-level read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLevel {
    L1,
    L2,
}

impl AdvancedCache {
    /// Read through L1 then L2
    pub async fn get_multi_level<V>(&self, key: &str) -> Option<V>
    where
        V: Serialize + DeserializeOwned,
    {
        self.get_multi_level_with_source(key).await.map(|(v, _)| v)
    }

    /// Read through L1 then L2, reporting which level answered
    pub async fn get_multi_level_with_source<V>(&self, key: &str) -> Option<(V, CacheLevel)>
    where
        V: Serialize + DeserializeOwned,
    {
        let manager = &self.inner.manager;

        if let Some(value) = manager.get_from::<V>(StrategyKind::InProcess, key).await {
            trace!(key, "L1 hit");
            return Some((value, CacheLevel::L1));
        }

        let value = manager.get_from::<V>(StrategyKind::Distributed, key).await?;
        trace!(key, "L2 hit, promoting to L1");
        manager
            .set_in(StrategyKind::InProcess, key, &value, Some(self.inner.config.l1_ttl))
            .await;
        Some((value, CacheLevel::L2))
    }

    /// Write L1 (with the L1 TTL, capped at `ttl`) and L2 (with `ttl`)
    ///
    /// Returns whether every registered level accepted the write.
    pub async fn set_multi_level<V>(&self, key: &str, value: &V, ttl: Duration) -> bool
    where
        V: Serialize + ?Sized,
    {
        let manager = &self.inner.manager;
        let l1_ttl = if ttl.is_zero() {
            self.inner.config.l1_ttl
        } else {
            self.inner.config.l1_ttl.min(ttl)
        };

        let l1 = manager
            .set_in(StrategyKind::InProcess, key, value, Some(l1_ttl))
            .await;
        let l2 = match manager.store(StrategyKind::Distributed) {
            Some(_) => {
                manager
                    .set_in(StrategyKind::Distributed, key, value, Some(ttl))
                    .await
            }
            None => true,
        };
        l1 && l2
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, DistributedStore, InMemoryRemote};
    use crate::coordinator::tests::coordinator;
    use crate::coordinator::CoordinatorConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let cache = coordinator(CoordinatorConfig::default());
        let manager = cache.manager();
        manager
            .set_in(StrategyKind::Distributed, "k", &"remote", None)
            .await;

        let (value, level) = cache
            .get_multi_level_with_source::<String>("k")
            .await
            .unwrap();
        assert_eq!(value, "remote");
        assert_eq!(level, CacheLevel::L2);

        let (_, level) = cache
            .get_multi_level_with_source::<String>("k")
            .await
            .unwrap();
        assert_eq!(level, CacheLevel::L1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promoted_value_uses_l1_ttl() {
        let cache = coordinator(CoordinatorConfig {
            l1_ttl: Duration::from_secs(5),
            ..Default::default()
        });
        cache
            .manager()
            .set_in(StrategyKind::Distributed, "k", &1u8, Some(Duration::from_secs(600)))
            .await;
        assert_eq!(cache.get_multi_level::<u8>("k").await, Some(1));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            cache.manager().get_from::<u8>(StrategyKind::InProcess, "k").await,
            None
        );
        assert_eq!(cache.get_multi_level::<u8>("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_set_writes_both_levels() {
        let cache = coordinator(CoordinatorConfig::default());
        assert!(cache.set_multi_level("k", &42u32, Duration::from_secs(300)).await);

        let manager = cache.manager();
        assert_eq!(manager.get_from::<u32>(StrategyKind::InProcess, "k").await, Some(42));
        assert_eq!(manager.get_from::<u32>(StrategyKind::Distributed, "k").await, Some(42));
    }

    #[tokio::test]
    async fn test_l2_outage_degrades_to_l1() {
        let remote = Arc::new(InMemoryRemote::new());
        let manager = CacheManager::new(Duration::from_secs(60)).with_store(
            StrategyKind::Distributed,
            Arc::new(DistributedStore::new(remote.clone(), "t:")),
        );
        let cache = AdvancedCache::new(Arc::new(manager), CoordinatorConfig::default());

        remote.set_available(false);
        assert!(!cache.set_multi_level("k", &1u8, Duration::from_secs(60)).await);
        assert_eq!(cache.get_multi_level::<u8>("k").await, Some(1));
        assert_eq!(cache.get_multi_level::<u8>("missing").await, None);
    }
}
