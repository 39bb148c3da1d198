//! Prometheus metrics for the governance layer.
//!
//! Counters are purely observational; no decision ever reads them back.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

    // Rate limiting
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "rate_limit_decisions_total";

    // Response cache gate
    pub const HTTP_CACHE_HITS_TOTAL: &str = "http_cache_hits_total";
    pub const HTTP_CACHE_MISSES_TOTAL: &str = "http_cache_misses_total";

    // Service result cache
    pub const SERVICE_CACHE_HITS_TOTAL: &str = "service_cache_hits_total";
    pub const SERVICE_CACHE_MISSES_TOTAL: &str = "service_cache_misses_total";
    pub const SERVICE_CACHE_INVALIDATIONS_TOTAL: &str = "service_cache_invalidations_total";

    // KV store
    pub const KV_ERRORS_TOTAL: &str = "kv_errors_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// HTTP Metrics
// =============================================================================

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    let status_class = match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    };

    let normalized_path = normalize_path(path);

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => normalized_path.clone(),
        "status_class" => status_class
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => normalized_path
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Governance Metrics
// =============================================================================

/// Record a rate limiter outcome (`allowed`, `denied`, `bypassed`, `fail_open`).
pub fn record_rate_limit(outcome: &'static str, kind: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "outcome" => outcome, "kind" => kind).increment(1);
}

/// Record a conditional request answered with 304.
pub fn record_http_cache_hit() {
    counter!(names::HTTP_CACHE_HITS_TOTAL).increment(1);
}

/// Record a response sent in full.
pub fn record_http_cache_miss() {
    counter!(names::HTTP_CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_service_cache_hit(namespace: &str) {
    counter!(names::SERVICE_CACHE_HITS_TOTAL, "namespace" => namespace.to_string()).increment(1);
}

pub fn record_service_cache_miss(namespace: &str) {
    counter!(names::SERVICE_CACHE_MISSES_TOTAL, "namespace" => namespace.to_string()).increment(1);
}

pub fn record_service_cache_invalidation(count: usize) {
    counter!(names::SERVICE_CACHE_INVALIDATIONS_TOTAL).increment(count as u64);
}

/// Record a failed KV operation (unreachable, timeout, protocol error).
pub fn record_kv_error(operation: &'static str) {
    counter!(names::KV_ERRORS_TOTAL, "operation" => operation).increment(1);
}

// =============================================================================
// Helpers
// =============================================================================

/// Replace numeric and UUID path segments to keep label cardinality bounded.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|part| if is_likely_id(part) { "{id}" } else { part })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_likely_id(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    if s.len() == 36 && s.chars().filter(|c| *c == '-').count() == 4 {
        return true;
    }
    s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/api/concepts/12345"), "/api/concepts/{id}");
        assert_eq!(
            normalize_path("/api/files/550e8400-e29b-41d4-a716-446655440000"),
            "/api/files/{id}"
        );
        assert_eq!(normalize_path("/graphql"), "/graphql");
    }

    #[test]
    fn test_is_likely_id() {
        assert!(is_likely_id("12345"));
        assert!(!is_likely_id("concepts"));
        assert!(!is_likely_id(""));
    }
}
