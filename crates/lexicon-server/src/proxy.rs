//! Forwarding of governed requests to the upstream application.

use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::context::{REQUEST_ID_HEADER, RequestContext};
use crate::server::GovernanceState;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("upstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("upstream request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Body(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Client(_) | ProxyError::Connect(_) | ProxyError::Request(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        (
            status,
            Json(json!({
                "error": "upstream_error",
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

/// HTTP client bound to the upstream base URL.
pub struct UpstreamProxy {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    body_limit: usize,
}

impl UpstreamProxy {
    pub fn new(config: &UpstreamConfig, base_url: &str, body_limit: usize) -> Result<Self, ProxyError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProxyError::Client)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            body_limit,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn forward(&self, request: Request<Body>) -> Result<Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", self.base_url, path_and_query);

        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop_header(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Some(ctx) = parts.extensions.get::<RequestContext>() {
            if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
                headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            if let Ok(value) = HeaderValue::from_str(&ctx.client_addr) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }

        let body = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|e| ProxyError::Body(e.to_string()))?;

        debug!(method = %parts.method, target = %target, "Forwarding request upstream");
        let upstream = self
            .client
            .request(parts.method.clone(), &target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::Timeout(self.timeout)
                } else if e.is_connect() {
                    ProxyError::Connect(e)
                } else {
                    ProxyError::Request(e)
                }
            })?;

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers().iter() {
            if !is_hop_by_hop_header(name.as_str()) {
                response_headers.append(name.clone(), value.clone());
            }
        }
        let bytes = upstream.bytes().await.map_err(ProxyError::Request)?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Router fallback: everything without a local route goes upstream.
pub async fn proxy_fallback(State(state): State<GovernanceState>, request: Request<Body>) -> Response {
    let Some(proxy) = state.upstream.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "message": "No upstream configured"})),
        )
            .into_response();
    };
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, upstream = %proxy.base_url(), "Upstream request failed");
            e.into_response()
        }
    }
}

/// Hop-by-hop headers (RFC 7230 §6.1) plus `host`, which must name the target.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}
