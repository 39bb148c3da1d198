use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis connection used by every governance component
    #[serde(default)]
    pub redis: RedisConfig,
    /// Bearer token decoding for identity extraction
    #[serde(default)]
    pub auth: AuthSettings,
    /// Application the governance layer forwards unmatched requests to
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache_control: CacheControlSettings,
    #[serde(default)]
    pub service_cache: ServiceCacheSettings,
    /// Service cache administration endpoints
    #[serde(default)]
    pub admin: AdminSettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs must be > 0".into());
        }
        if self.rate_limit.authenticated_per_minute == 0 || self.rate_limit.anonymous_per_minute == 0
        {
            return Err("rate_limit limits must be > 0".into());
        }
        if self.service_cache.max_keys == 0 {
            return Err("service_cache.max_keys must be > 0".into());
        }
        if self.service_cache.key_prefix.is_empty() || self.service_cache.key_prefix.contains('*') {
            return Err("service_cache.key_prefix must be non-empty and contain no wildcard".into());
        }
        if self.admin.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err("admin.token must not be empty when set".into());
        }
        if let Some(url) = self.upstream.url.as_deref()
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err("upstream.url must be an http(s) URL".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body buffered for write detection
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis configuration.
///
/// Every governance component degrades gracefully when Redis is disabled or
/// unreachable: rate limiting and caching fail open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis. When disabled an in-process store is used, which is only
    /// correct for single-instance deployments.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connect and per-command timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_enabled() -> bool {
    false
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    500
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

/// Settings for decoding already-issued bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer. Without it every request is
    /// treated as anonymous.
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the application behind the governance layer
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests per window for callers with a valid identity token
    #[serde(default = "default_authenticated_limit")]
    pub authenticated_per_minute: u64,

    /// Requests per window for anonymous callers, keyed by client address
    #[serde(default = "default_anonymous_limit")]
    pub anonymous_per_minute: u64,

    /// Counter lifetime in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// JSON object mapping endpoint regex to per-kind limits, e.g.
    /// `{"^/graphql$": {"authenticated": 200, "anonymous": 50}}`.
    /// Entries are evaluated in the order written; the first match wins.
    #[serde(default)]
    pub endpoint_limits: Option<String>,

    /// Client addresses or CIDR networks that are never limited. Empty by
    /// default: the client address comes from forwarding headers, so a
    /// loopback entry would exempt anyone who sends `X-Forwarded-For: 127.0.0.1`.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Path prefixes that are never limited
    #[serde(default = "default_rate_limit_excluded")]
    pub excluded_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_authenticated_limit() -> u64 {
    100
}
fn default_anonymous_limit() -> u64 {
    30
}
fn default_window_secs() -> u64 {
    60
}
fn default_rate_limit_excluded() -> Vec<String> {
    vec!["/healthz".into(), "/readyz".into(), "/metrics".into()]
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            authenticated_per_minute: default_authenticated_limit(),
            anonymous_per_minute: default_anonymous_limit(),
            window_secs: default_window_secs(),
            endpoint_limits: None,
            whitelist: Vec::new(),
            excluded_paths: default_rate_limit_excluded(),
        }
    }
}

/// HTTP Cache-Control / ETag configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControlSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// max-age for read queries on the GraphQL endpoint
    #[serde(default = "default_query_max_age")]
    pub query_max_age: u64,

    /// max-age for other cacheable paths
    #[serde(default = "default_max_age")]
    pub default_max_age: u64,

    /// Path prefixes whose responses are passed through untouched
    #[serde(default = "default_cache_excluded")]
    pub excluded_paths: Vec<String>,

    /// The single RPC-style endpoint whose body carries the operation
    #[serde(default = "default_graphql_path")]
    pub graphql_path: String,

    /// Liveness/readiness paths answered with `no-cache`
    #[serde(default = "default_health_paths")]
    pub health_paths: Vec<String>,
}

fn default_query_max_age() -> u64 {
    60
}
fn default_max_age() -> u64 {
    300
}
fn default_cache_excluded() -> Vec<String> {
    vec!["/admin".into(), "/metrics".into()]
}
fn default_graphql_path() -> String {
    "/graphql".into()
}
fn default_health_paths() -> Vec<String> {
    vec!["/healthz".into(), "/readyz".into(), "/health".into()]
}

impl Default for CacheControlSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            query_max_age: default_query_max_age(),
            default_max_age: default_max_age(),
            excluded_paths: default_cache_excluded(),
            graphql_path: default_graphql_path(),
            health_paths: default_health_paths(),
        }
    }
}

/// Service result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// TTL applied when an operation does not set its own
    #[serde(default = "default_service_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Key budget used for the health classification
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Namespace prefix for every cache entry
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_service_ttl_secs() -> u64 {
    300
}
fn default_max_keys() -> usize {
    10_000
}
fn default_key_prefix() -> String {
    "cache".into()
}

impl ServiceCacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for ServiceCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_service_ttl_secs(),
            max_keys: default_max_keys(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Service cache administration endpoints (`/admin/cache/*`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminSettings {
    /// Mount the endpoints. Off by default; they can wipe the whole cache.
    #[serde(default)]
    pub enabled: bool,

    /// Bearer token required on every admin request when set
    #[serde(default)]
    pub token: Option<String>,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Keys whose environment values are comma-separated lists.
    const LIST_KEYS: [&str; 4] = [
        "rate_limit.whitelist",
        "rate_limit.excluded_paths",
        "cache_control.excluded_paths",
        "cache_control.health_paths",
    ];

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("lexicon.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., LEXICON__RATE_LIMIT__ENABLED=false
        let mut env = Environment::with_prefix("LEXICON")
            .try_parsing(true)
            .separator("__")
            .list_separator(",");
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }
        builder = builder.add_source(env);
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
