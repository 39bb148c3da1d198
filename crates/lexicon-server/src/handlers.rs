use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::GovernanceState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready as long as the process is serving. An unreachable store degrades
/// governance to fail-open, so it is reported but does not fail readiness.
pub async fn readyz(State(state): State<GovernanceState>) -> impl IntoResponse {
    let kv_ok = state.kv.ping().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": if kv_ok { "ready" } else { "degraded" },
            "kv": {
                "backend": state.kv.backend(),
                "reachable": kv_ok,
            },
        })),
    )
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// ---- Service cache administration ----

pub async fn cache_stats(State(state): State<GovernanceState>) -> impl IntoResponse {
    Json(state.service_cache.admin().stats().await)
}

pub async fn cache_health(State(state): State<GovernanceState>) -> impl IntoResponse {
    Json(state.service_cache.admin().health().await)
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

pub async fn invalidate_cache(
    State(state): State<GovernanceState>,
    Json(request): Json<InvalidateRequest>,
) -> impl IntoResponse {
    let admin = state.service_cache.admin();
    match (request.pattern, request.key) {
        (Some(pattern), None) if !pattern.trim().is_empty() => {
            let deleted = admin.invalidate(&pattern).await;
            (StatusCode::OK, Json(json!({ "pattern": pattern, "deleted": deleted })))
        }
        (None, Some(key)) if !key.trim().is_empty() => {
            let deleted = admin.invalidate_key(&key).await;
            (
                StatusCode::OK,
                Json(json!({ "key": key, "deleted": usize::from(deleted) })),
            )
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_request",
                "message": "Provide exactly one of `pattern` or `key`",
            })),
        ),
    }
}

pub async fn clear_cache(State(state): State<GovernanceState>) -> impl IntoResponse {
    let deleted = state.service_cache.admin().clear_all().await;
    Json(json!({ "deleted": deleted }))
}
