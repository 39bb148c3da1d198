//! Memoization of expensive, side-effect-free service operations.
//!
//! An operation is wrapped once at startup:
//!
//! ```ignore
//! let concepts = cache.wrap(
//!     "list_concepts",
//!     CacheOptions::new("concepts").ttl(Duration::from_secs(120)),
//!     move |filter: ConceptFilter| {
//!         let repo = repo.clone();
//!         async move { repo.list(filter).await }
//!     },
//! );
//! let page = concepts.call(&ctx, filter).await;
//! ```
//!
//! The wrapper is transparent: whatever happens in the store, the caller gets
//! the operation's real result. Cached values are stored as JSON documents and
//! rebuilt through `Deserialize`, so a hit is plain data, never a live record.

pub mod admin;
pub mod keys;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::config::ServiceCacheSettings;
use crate::context::RequestContext;
use crate::kv::SharedKvStore;
use crate::metrics;

pub use admin::{CacheAdmin, CacheHealth, CacheStats, CacheStatus};

/// Builds the key suffix from the operation's arguments.
pub type KeyBuilder<A> = Arc<dyn Fn(&A) -> String + Send + Sync>;

/// Per-operation caching options.
pub struct CacheOptions<A> {
    pub namespace: String,
    /// Falls back to the configured default TTL
    pub ttl: Option<Duration>,
    /// Also cache results that serialize to `null`
    pub cache_none: bool,
    pub key_builder: Option<KeyBuilder<A>>,
}

impl<A> CacheOptions<A> {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ttl: None,
            cache_none: false,
            key_builder: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cache_none(mut self, cache_none: bool) -> Self {
        self.cache_none = cache_none;
        self
    }

    pub fn key_builder(mut self, builder: impl Fn(&A) -> String + Send + Sync + 'static) -> Self {
        self.key_builder = Some(Arc::new(builder));
        self
    }
}

/// Shared entry point for result caching.
pub struct ServiceCache {
    kv: SharedKvStore,
    settings: ServiceCacheSettings,
}

impl ServiceCache {
    pub fn new(kv: SharedKvStore, settings: ServiceCacheSettings) -> Self {
        Self { kv, settings }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn settings(&self) -> &ServiceCacheSettings {
        &self.settings
    }

    /// Administrative view over the same store and prefix.
    pub fn admin(&self) -> CacheAdmin {
        CacheAdmin::new(self.kv.clone(), self.settings.clone())
    }

    /// Wrap `operation` so calls go through the cache.
    ///
    /// Anything the operation needs besides its arguments (repositories,
    /// clients) is captured by the closure and never becomes part of the key.
    pub fn wrap<A, F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        options: CacheOptions<A>,
        operation: F,
    ) -> CachedOperation<A, F> {
        CachedOperation {
            cache: Arc::clone(self),
            name: name.into(),
            options,
            operation,
            _args: PhantomData,
        }
    }

    /// Read-through for an ad-hoc key under `namespace`.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        id: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.is_enabled() {
            return compute().await;
        }
        let key = format!("{}:{namespace}:{id}", self.settings.key_prefix);
        if let Some(hit) = self.lookup(ctx, namespace, &key).await {
            return hit;
        }
        let value = compute().await;
        self.store(ctx, &key, &value, ttl, false).await;
        value
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        namespace: &str,
        key: &str,
    ) -> Option<T> {
        let Some(raw) = self.kv.get(key).await else {
            metrics::record_service_cache_miss(namespace);
            return None;
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                metrics::record_service_cache_hit(namespace);
                tracing::debug!(key = %key, request_id = %ctx.request_id, "Service cache hit");
                Some(value)
            }
            Err(e) => {
                metrics::record_service_cache_miss(namespace);
                tracing::warn!(
                    key = %key,
                    error = %e,
                    request_id = %ctx.request_id,
                    "Cached value no longer deserializes; treating as miss"
                );
                None
            }
        }
    }

    async fn store<T: Serialize>(
        &self,
        ctx: &RequestContext,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        cache_none: bool,
    ) {
        let document = match serde_json::to_value(value) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    request_id = %ctx.request_id,
                    "Result not serializable; skipping cache"
                );
                return;
            }
        };
        if document.is_null() && !cache_none {
            return;
        }
        let payload = match serde_json::to_string(&document) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to encode cached value");
                return;
            }
        };
        let ttl = ttl.unwrap_or_else(|| self.settings.default_ttl());
        if !self.kv.set(key, &payload, Some(ttl)).await {
            tracing::debug!(key = %key, request_id = %ctx.request_id, "Service cache write skipped");
        }
    }
}

/// An operation wrapped by [`ServiceCache::wrap`].
pub struct CachedOperation<A, F> {
    cache: Arc<ServiceCache>,
    name: String,
    options: CacheOptions<A>,
    operation: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> CachedOperation<A, F>
where
    A: Serialize,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.options.namespace
    }

    /// Full store key for `args`, or `None` if the arguments cannot be hashed.
    pub fn key_for(&self, args: &A) -> Option<String> {
        let suffix = match &self.options.key_builder {
            Some(builder) => builder(args),
            None => match keys::args_hash(args) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::warn!(
                        operation = %self.name,
                        error = %e,
                        "Arguments not serializable; calling through"
                    );
                    return None;
                }
            },
        };
        Some(keys::entry_key(
            &self.cache.settings.key_prefix,
            &self.options.namespace,
            &self.name,
            &suffix,
        ))
    }

    /// Call the operation, serving a cached result when one exists.
    pub async fn call<T, Fut>(&self, ctx: &RequestContext, args: A) -> T
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = T>,
        T: Serialize + DeserializeOwned,
    {
        if !self.cache.is_enabled() {
            return (self.operation)(args).await;
        }
        let Some(key) = self.key_for(&args) else {
            return (self.operation)(args).await;
        };
        if let Some(hit) = self.cache.lookup(ctx, &self.options.namespace, &key).await {
            return hit;
        }

        let result = (self.operation)(args).await;
        self.cache
            .store(ctx, &key, &result, self.options.ttl, self.options.cache_none)
            .await;
        result
    }

    /// Like [`call`](Self::call) for fallible operations; only `Ok` values
    /// are cached.
    pub async fn try_call<T, E, Fut>(&self, ctx: &RequestContext, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
    {
        if !self.cache.is_enabled() {
            return (self.operation)(args).await;
        }
        let Some(key) = self.key_for(&args) else {
            return (self.operation)(args).await;
        };
        if let Some(hit) = self.cache.lookup::<T>(ctx, &self.options.namespace, &key).await {
            return Ok(hit);
        }

        let value = (self.operation)(args).await?;
        self.cache
            .store(ctx, &key, &value, self.options.ttl, self.options.cache_none)
            .await;
        Ok(value)
    }
}
