//! Redis-backed store.
//!
//! Every command runs under the configured timeout. Errors are converted to
//! the neutral value of the operation at the trait boundary and logged.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;

use super::{KeyTtl, KvStore};
use crate::config::RedisConfig;

/// Page size hint for `SCAN`.
const SCAN_COUNT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("failed to create Redis pool: {0}")]
    PoolCreate(#[from] deadpool_redis::CreatePoolError),

    #[error("failed to get Redis connection: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Redis command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("Redis did not answer within {0:?}")]
    Timeout(Duration),
}

/// Redis store backed by a deadpool connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
}

impl RedisStore {
    /// Build the pool. No connection is opened until the first command.
    pub fn connect(config: &RedisConfig) -> Result<Self, KvError> {
        let timeout = config.timeout();
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1))?;
        Ok(Self { pool, timeout })
    }

    pub fn from_pool(pool: Pool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Run one command on a pooled connection under the store timeout.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, KvError>
    where
        T: Send,
        F: FnOnce(Connection) -> Fut + Send,
        Fut: Future<Output = Result<T, redis::RedisError>> + Send,
    {
        let work = async {
            let conn = self.pool.get().await?;
            Ok::<T, KvError>(op(conn).await?)
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| KvError::Timeout(self.timeout))?
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let timeout = self.timeout;
        let work = async {
            let mut conn = self.pool.get().await?;
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok::<_, KvError>(keys)
        };
        // A full scan may take several round trips; allow a few timeouts' worth.
        tokio::time::timeout(timeout * 10, work)
            .await
            .map_err(|_| KvError::Timeout(timeout * 10))?
    }
}

fn log_failure(operation: &'static str, key: &str, error: &KvError) {
    crate::metrics::record_kv_error(operation);
    tracing::warn!(operation, key = %key, error = %error, "Redis unavailable");
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Option<String> {
        let k = key.to_string();
        match self
            .run(|mut conn| async move { conn.get::<_, Option<String>>(k).await })
            .await
        {
            Ok(value) => value,
            Err(e) => {
                log_failure("get", key, &e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let (k, v) = (key.to_string(), value.to_string());
        let result = match ttl {
            // SETEX rejects 0, so sub-second TTLs round up.
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                self.run(|mut conn| async move { conn.set_ex::<_, _, ()>(k, v, secs).await })
                    .await
            }
            None => {
                self.run(|mut conn| async move { conn.set::<_, _, ()>(k, v).await })
                    .await
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log_failure("set", key, &e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let k = key.to_string();
        match self
            .run(|mut conn| async move { conn.del::<_, i64>(k).await })
            .await
        {
            Ok(removed) => removed > 0,
            Err(e) => {
                log_failure("delete", key, &e);
                false
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        let k = key.to_string();
        match self
            .run(|mut conn| async move { conn.exists::<_, bool>(k).await })
            .await
        {
            Ok(found) => found,
            Err(e) => {
                log_failure("exists", key, &e);
                false
            }
        }
    }

    async fn ttl(&self, key: &str) -> KeyTtl {
        let k = key.to_string();
        match self
            .run(|mut conn| async move { conn.ttl::<_, i64>(k).await })
            .await
        {
            Ok(reply) => KeyTtl::from_redis(reply),
            Err(e) => {
                log_failure("ttl", key, &e);
                KeyTtl::Missing
            }
        }
    }

    async fn increment(&self, key: &str, by: i64) -> Option<i64> {
        let k = key.to_string();
        match self
            .run(|mut conn| async move { conn.incr::<_, _, i64>(k, by).await })
            .await
        {
            Ok(value) => Some(value),
            Err(e) => {
                log_failure("increment", key, &e);
                None
            }
        }
    }

    async fn expire(&self, key: &str, seconds: u64) -> bool {
        let k = key.to_string();
        let secs = i64::try_from(seconds).unwrap_or(i64::MAX);
        match self
            .run(|mut conn| async move { conn.expire::<_, bool>(k, secs).await })
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                log_failure("expire", key, &e);
                false
            }
        }
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        match self.scan_keys(pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                log_failure("scan", pattern, &e);
                Vec::new()
            }
        }
    }

    async fn ping(&self) -> bool {
        let result = self
            .run(|mut conn| async move {
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, redis::RedisError>(pong)
            })
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Redis ping failed");
                false
            }
        }
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
