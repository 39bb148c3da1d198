//! Fail-open key/value store client.
//!
//! ## Backends
//!
//! - **Redis**: shared across instances, used in production
//! - **Memory**: DashMap with per-key expiry, for single-instance runs and tests
//!
//! ## Graceful Degradation
//!
//! No operation returns an error. A store that cannot be reached (or does not
//! answer within the configured timeout) yields the neutral value of the
//! operation (`None`, `false`, an empty list) and the failure is logged at
//! warn level. Callers choose fail-open or fail-closed semantics themselves.

pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use redis_store::{KvError, RedisStore};

use crate::config::RedisConfig;

/// Shared handle to the configured store.
pub type SharedKvStore = Arc<dyn KvStore>;

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key exists and expires after this many seconds.
    Expires(u64),
    /// Key exists without an expiry.
    Persistent,
    /// Key does not exist (or the store could not be asked).
    Missing,
}

impl KeyTtl {
    /// Map Redis `TTL` replies (-2 missing, -1 no expiry) to a `KeyTtl`.
    pub fn from_redis(reply: i64) -> Self {
        match reply {
            -1 => KeyTtl::Persistent,
            n if n >= 0 => KeyTtl::Expires(n as u64),
            _ => KeyTtl::Missing,
        }
    }
}

/// Uniform, never-failing interface over a networked key/value service.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value. `None` means absent or unavailable.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store a value, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool;

    /// Delete a key. Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> bool;

    async fn exists(&self, key: &str) -> bool;

    async fn ttl(&self, key: &str) -> KeyTtl;

    /// Atomically add `by` to an integer key, creating it at zero first.
    /// `None` means the store is unavailable or the value is not an integer.
    async fn increment(&self, key: &str, by: i64) -> Option<i64>;

    /// Set a key's TTL. Returns `false` when the key is missing.
    async fn expire(&self, key: &str, seconds: u64) -> bool;

    /// Keys matching a Redis glob pattern (`*`, `?`, `[...]`, backslash
    /// escapes).
    async fn scan(&self, pattern: &str) -> Vec<String>;

    /// Round-trip check used for health and readiness.
    async fn ping(&self) -> bool;

    /// Backend label for stats and logs.
    fn backend(&self) -> &'static str;
}

/// Create a KV store based on configuration.
///
/// - **Redis disabled**: in-memory store
/// - **Redis enabled**: Redis pool. If the pool cannot be built the memory
///   store is used instead; if Redis does not answer at startup the pool is
///   kept so the layer recovers once Redis is back, failing open meanwhile.
pub async fn create_kv_store(config: &RedisConfig) -> SharedKvStore {
    if !config.enabled {
        tracing::info!("Redis disabled, using in-memory store");
        return Arc::new(MemoryStore::new());
    }

    tracing::info!(url = %config.url, "Connecting to Redis");

    let store = match RedisStore::connect(config) {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to in-memory store."
            );
            return Arc::new(MemoryStore::new());
        }
    };

    if store.ping().await {
        tracing::info!("Connected to Redis");
    } else {
        tracing::warn!(
            url = %config.url,
            "Redis is not answering; rate limiting and caching fail open until it is"
        );
    }

    Arc::new(store)
}
