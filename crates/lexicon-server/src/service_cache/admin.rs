//! Invalidation and health reporting over the service cache keyspace.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ServiceCacheSettings;
use crate::kv::SharedKvStore;
use crate::metrics;

use super::keys::{namespace_of, scoped_pattern};

/// Usage share (percent of `max_keys`) at which the cache reports a warning.
const WARNING_THRESHOLD: f64 = 90.0;
const CRITICAL_THRESHOLD: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Healthy,
    Warning,
    Critical,
    Unavailable,
}

impl CacheStatus {
    fn from_usage(usage_percent: f64) -> Self {
        if usage_percent >= CRITICAL_THRESHOLD {
            CacheStatus::Critical
        } else if usage_percent >= WARNING_THRESHOLD {
            CacheStatus::Warning
        } else {
            CacheStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_keys: usize,
    pub by_namespace: BTreeMap<String, usize>,
    pub max_keys: usize,
    pub usage_percent: f64,
    pub status: CacheStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: CacheStatus,
    pub backend: &'static str,
    pub total_keys: usize,
    pub usage_percent: f64,
}

/// Maintenance operations. Never fails: an unreachable store reads as empty
/// and deletes nothing.
#[derive(Clone)]
pub struct CacheAdmin {
    kv: SharedKvStore,
    settings: ServiceCacheSettings,
}

impl CacheAdmin {
    pub fn new(kv: SharedKvStore, settings: ServiceCacheSettings) -> Self {
        Self { kv, settings }
    }

    fn prefix(&self) -> &str {
        &self.settings.key_prefix
    }

    /// Delete every key matching `pattern` (glob, anchored under the cache
    /// prefix). Returns how many were removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let pattern = scoped_pattern(self.prefix(), pattern);
        let keys = self.kv.scan(&pattern).await;
        let mut deleted = 0;
        for key in &keys {
            if self.kv.delete(key).await {
                deleted += 1;
            }
        }
        metrics::record_service_cache_invalidation(deleted);
        tracing::info!(pattern = %pattern, matched = keys.len(), deleted, "Cache invalidated");
        deleted
    }

    pub async fn invalidate_key(&self, key: &str) -> bool {
        let key = scoped_pattern(self.prefix(), key);
        let removed = self.kv.delete(&key).await;
        if removed {
            metrics::record_service_cache_invalidation(1);
        }
        tracing::info!(key = %key, removed, "Cache key invalidated");
        removed
    }

    pub async fn invalidate_namespace(&self, namespace: &str) -> usize {
        self.invalidate(&format!("{namespace}:*")).await
    }

    /// Drop every service cache entry. Rate limit counters are untouched.
    pub async fn clear_all(&self) -> usize {
        tracing::warn!(prefix = %self.prefix(), "Clearing the whole service cache");
        self.invalidate("*").await
    }

    pub async fn stats(&self) -> CacheStats {
        let keys = self.kv.scan(&format!("{}:*", self.prefix())).await;
        let mut by_namespace = BTreeMap::new();
        for key in &keys {
            if let Some(namespace) = namespace_of(self.prefix(), key) {
                *by_namespace.entry(namespace.to_string()).or_insert(0) += 1;
            }
        }

        let max_keys = self.settings.max_keys;
        let usage_percent = if max_keys == 0 {
            0.0
        } else {
            keys.len() as f64 / max_keys as f64 * 100.0
        };
        CacheStats {
            total_keys: keys.len(),
            by_namespace,
            max_keys,
            usage_percent,
            status: CacheStatus::from_usage(usage_percent),
        }
    }

    pub async fn health(&self) -> CacheHealth {
        if !self.kv.ping().await {
            return CacheHealth {
                status: CacheStatus::Unavailable,
                backend: self.kv.backend(),
                total_keys: 0,
                usage_percent: 0.0,
            };
        }
        let stats = self.stats().await;
        CacheHealth {
            status: stats.status,
            backend: self.kv.backend(),
            total_keys: stats.total_keys,
            usage_percent: stats.usage_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvStore, MemoryStore};
    use std::sync::Arc;

    async fn seeded(max_keys: usize) -> (CacheAdmin, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for key in [
            "cache:concepts:list:a1",
            "cache:concepts:get:b2",
            "cache:languages:all:c3",
            "rate_limit:ip:10.0.0.1:/graphql",
        ] {
            store.set(key, "1", None).await;
        }
        let settings = ServiceCacheSettings {
            max_keys,
            ..ServiceCacheSettings::default()
        };
        (CacheAdmin::new(store.clone(), settings), store)
    }

    #[tokio::test]
    async fn invalidation_is_idempotent() {
        let (admin, _) = seeded(100).await;
        assert_eq!(admin.invalidate("concepts:*").await, 2);
        assert_eq!(admin.invalidate("concepts:*").await, 0);
        assert_eq!(admin.stats().await.total_keys, 1);
    }

    #[tokio::test]
    async fn clear_all_spares_rate_limit_counters() {
        let (admin, store) = seeded(100).await;
        assert_eq!(admin.clear_all().await, 3);
        assert!(store.exists("rate_limit:ip:10.0.0.1:/graphql").await);
    }

    #[tokio::test]
    async fn single_keys_and_namespaces() {
        let (admin, _) = seeded(100).await;
        assert!(admin.invalidate_key("cache:languages:all:c3").await);
        assert!(!admin.invalidate_key("languages:all:c3").await);
        assert_eq!(admin.invalidate_namespace("concepts").await, 2);
    }

    #[tokio::test]
    async fn stats_group_by_namespace_and_classify_usage() {
        let (admin, _) = seeded(100).await;
        let stats = admin.stats().await;
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.by_namespace.get("concepts"), Some(&2));
        assert_eq!(stats.by_namespace.get("languages"), Some(&1));
        assert_eq!(stats.status, CacheStatus::Healthy);

        let (admin, _) = seeded(3).await;
        assert_eq!(admin.stats().await.status, CacheStatus::Critical);
    }

    #[test]
    fn usage_thresholds() {
        assert_eq!(CacheStatus::from_usage(0.0), CacheStatus::Healthy);
        assert_eq!(CacheStatus::from_usage(89.9), CacheStatus::Healthy);
        assert_eq!(CacheStatus::from_usage(90.0), CacheStatus::Warning);
        assert_eq!(CacheStatus::from_usage(99.9), CacheStatus::Warning);
        assert_eq!(CacheStatus::from_usage(100.0), CacheStatus::Critical);
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let (admin, _) = seeded(100).await;
        let health = admin.health().await;
        assert_eq!(health.status, CacheStatus::Healthy);
        assert_eq!(health.backend, "memory");
        assert_eq!(health.total_keys, 3);
    }
}
