//! Integration tests against a real Redis.
//!
//! Tests use testcontainers and need a Docker daemon:
//! `cargo test --test redis_kv -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use lexicon_server::RequestContext;
use lexicon_server::config::{RateLimitSettings, RedisConfig, ServiceCacheSettings};
use lexicon_server::kv::{KeyTtl, KvStore, RedisStore, create_kv_store};
use lexicon_server::rate_limit::{RateLimitDecision, RateLimitPolicy, RateLimiter};
use lexicon_server::service_cache::{CacheAdmin, CacheStatus};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);
            (container, url)
        })
        .await;
    url.clone()
}

async fn store() -> RedisStore {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 4,
        timeout_ms: 2_000,
    };
    RedisStore::connect(&config).expect("create pool")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn basic_operations() {
    let store = store().await;
    let key = unique("basic");

    assert!(store.ping().await);
    assert_eq!(store.get(&key).await, None);
    assert!(store.set(&key, "value", Some(Duration::from_secs(60))).await);
    assert_eq!(store.get(&key).await.as_deref(), Some("value"));
    assert!(store.exists(&key).await);
    assert!(matches!(store.ttl(&key).await, KeyTtl::Expires(secs) if secs <= 60));
    assert!(store.delete(&key).await);
    assert!(!store.delete(&key).await);
    assert_eq!(store.ttl(&key).await, KeyTtl::Missing);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn increments_are_atomic_across_tasks() {
    let store = Arc::new(store().await);
    let key = unique("counter");

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move { store.increment(&key, 1).await }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_some());
    }
    assert_eq!(store.get(&key).await.as_deref(), Some("20"));
    assert_eq!(store.ttl(&key).await, KeyTtl::Persistent);
    assert!(store.expire(&key, 30).await);
    assert!(matches!(store.ttl(&key).await, KeyTtl::Expires(_)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn scan_walks_every_page() {
    let store = store().await;
    let namespace = unique("scan");
    for i in 0..1_200 {
        store
            .set(&format!("{namespace}:{i}"), "x", Some(Duration::from_secs(60)))
            .await;
    }
    assert_eq!(store.scan(&format!("{namespace}:*")).await.len(), 1_200);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_requests_never_exceed_the_limit() {
    let store = create_kv_store(&RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 8,
        timeout_ms: 2_000,
    })
    .await;
    assert_eq!(store.backend(), "redis");

    let settings = RateLimitSettings {
        anonymous_per_minute: 10,
        whitelist: Vec::new(),
        ..RateLimitSettings::default()
    };
    let limiter = Arc::new(RateLimiter::new(
        store,
        RateLimitPolicy::from_settings(&settings),
    ));
    let ctx = RequestContext {
        request_id: "concurrency".into(),
        identity: None,
        client_addr: unique("client"),
        method: Method::GET,
        path: "/api/test".into(),
        has_authorization: false,
    };

    let mut tasks = Vec::new();
    for _ in 0..40 {
        let limiter = limiter.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move { limiter.check(&ctx).await }));
    }
    let mut allowed = 0;
    for task in tasks {
        match task.await.unwrap() {
            RateLimitDecision::Allowed(_) => allowed += 1,
            RateLimitDecision::Denied { retry_after, .. } => assert!(retry_after > 0),
            RateLimitDecision::Bypassed => panic!("nothing should bypass"),
        }
    }
    assert_eq!(allowed, 10);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn invalidation_and_stats_over_redis() {
    let store: Arc<RedisStore> = Arc::new(store().await);
    let prefix = unique("cache");
    let admin = CacheAdmin::new(
        store.clone(),
        ServiceCacheSettings {
            key_prefix: prefix.clone(),
            max_keys: 4,
            ..ServiceCacheSettings::default()
        },
    );
    for key in ["concepts:list:1", "concepts:list:2", "languages:all:1"] {
        store
            .set(&format!("{prefix}:{key}"), "{}", Some(Duration::from_secs(60)))
            .await;
    }

    let stats = admin.stats().await;
    assert_eq!(stats.total_keys, 3);
    assert_eq!(stats.status, CacheStatus::Healthy);
    assert_eq!(admin.health().await.backend, "redis");

    assert_eq!(admin.invalidate_namespace("concepts").await, 2);
    assert_eq!(admin.invalidate_namespace("concepts").await, 0);
    assert_eq!(admin.clear_all().await, 1);
}
