use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::context::{REQUEST_ID_HEADER, request_context};
use crate::identity::{AnonymousOnly, IdentityExtractor, JwtIdentityExtractor};
use crate::kv::{SharedKvStore, create_kv_store};
use crate::proxy::{UpstreamProxy, proxy_fallback};
use crate::rate_limit::{RateLimitPolicy, RateLimiter, rate_limit_middleware};
use crate::response_cache::{CacheControlPolicy, ResponseCacheGate, response_cache_middleware};
use crate::service_cache::ServiceCache;
use crate::{handlers, metrics};

/// Everything the governance layer shares across request tasks.
///
/// Built once from an immutable `AppConfig`; cloning is cheap.
#[derive(Clone)]
pub struct GovernanceState {
    pub config: Arc<AppConfig>,
    pub kv: SharedKvStore,
    pub identity: Arc<dyn IdentityExtractor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub response_cache: Arc<ResponseCacheGate>,
    pub service_cache: Arc<ServiceCache>,
    pub upstream: Option<Arc<UpstreamProxy>>,
}

impl GovernanceState {
    /// Assemble the components over an existing store.
    pub fn new(config: AppConfig, kv: SharedKvStore) -> anyhow::Result<Self> {
        let identity: Arc<dyn IdentityExtractor> = match config.auth.jwt_secret.as_deref() {
            Some(secret) if !secret.is_empty() => Arc::new(JwtIdentityExtractor::new(secret)),
            _ => {
                tracing::info!("No JWT secret configured; all callers are rate limited by address");
                Arc::new(AnonymousOnly)
            }
        };

        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            RateLimitPolicy::from_settings(&config.rate_limit),
        ));
        let response_cache = Arc::new(ResponseCacheGate::new(
            CacheControlPolicy::new(config.cache_control.clone()),
            config.server.body_limit_bytes,
        ));
        let service_cache = Arc::new(ServiceCache::new(
            kv.clone(),
            config.service_cache.clone(),
        ));
        let upstream = match config.upstream.url.as_deref() {
            Some(url) => Some(Arc::new(UpstreamProxy::new(
                &config.upstream,
                url,
                config.server.body_limit_bytes,
            )?)),
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            kv,
            identity,
            rate_limiter,
            response_cache,
            service_cache,
            upstream,
        })
    }

    /// Connect the configured store, then assemble the components.
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let kv = create_kv_store(&config.redis).await;
        Self::new(config, kv)
    }

    /// Replace the identity extractor (custom token formats, tests).
    pub fn with_identity_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.identity = extractor;
        self
    }
}

/// Wrap `router` with the governance middleware.
///
/// Order on the way in: request context, rate limiter, response cache gate,
/// handler. A rejected request therefore never reaches the cache gate.
pub fn apply_governance<S>(router: Router<S>, state: &GovernanceState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(middleware::from_fn_with_state(
            state.response_cache.clone(),
            response_cache_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.identity.clone(),
            request_context,
        ))
}

pub fn build_app(state: &GovernanceState) -> Router {
    let mut router = Router::new()
        // Health and monitoring endpoints
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics));

    if state.config.admin.enabled {
        router = router.merge(admin_routes(state.config.admin.token.as_deref()));
    }

    if state.upstream.is_some() {
        router = router.fallback(proxy_fallback);
    }

    let router = router.with_state(state.clone());

    apply_governance(router, state)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<Body>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &Response, latency: std::time::Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
}

/// Service cache administration, guarded by a bearer token when one is set.
fn admin_routes(token: Option<&str>) -> Router<GovernanceState> {
    let routes = Router::new()
        .route("/admin/cache/stats", get(handlers::cache_stats))
        .route("/admin/cache/health", get(handlers::cache_health))
        .route("/admin/cache/invalidate", post(handlers::invalidate_cache))
        .route("/admin/cache", delete(handlers::clear_cache));
    match token {
        Some(token) => routes.route_layer(middleware::from_fn_with_state(
            Arc::<str>::from(token),
            require_admin_token,
        )),
        None => {
            tracing::warn!("Cache admin endpoints enabled without admin.token");
            routes
        }
    }
}

async fn require_admin_token(
    State(token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(&*token) {
        return next.run(req).await;
    }
    tracing::warn!(path = %req.uri().path(), "Rejected cache admin request");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "unauthorized",
            "message": "Admin token required",
        })),
    )
        .into_response()
}

async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let res = next.run(req).await;
    metrics::record_http_request(&method, &path, res.status().as_u16(), started.elapsed());
    res
}

pub struct LexiconServer {
    addr: SocketAddr,
    app: Router,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<LexiconServer> {
        let state = GovernanceState::from_config(self.config).await?;
        Ok(LexiconServer {
            addr: self.addr,
            app: build_app(&state),
        })
    }
}

impl LexiconServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
