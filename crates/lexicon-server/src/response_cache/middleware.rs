use std::sync::Arc;

use axum::{
    Json,
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderValue, Request, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, ETAG, IF_NONE_MATCH, VARY},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::metrics;

use super::detect;
use super::etag::{compute_etag, if_none_match};
use super::policy::{CacheControlPolicy, CacheInput, allows_validation};

/// Response cache gate shared by every request task.
///
/// `body_limit` bounds both the request bodies buffered for classification
/// and the response bodies buffered for fingerprinting.
pub struct ResponseCacheGate {
    policy: CacheControlPolicy,
    body_limit: usize,
}

impl ResponseCacheGate {
    pub fn new(policy: CacheControlPolicy, body_limit: usize) -> Self {
        Self { policy, body_limit }
    }

    pub fn policy(&self) -> &CacheControlPolicy {
        &self.policy
    }
}

/// Attach `Cache-Control`/`ETag` to outgoing responses and answer matching
/// conditional requests with 304.
///
/// POST bodies are buffered (up to the configured limit) to tell reads from
/// writes, then handed on unchanged. Reusable responses are buffered once to
/// fingerprint them; a response without a known size within the limit is sent
/// as is, with the directive but no `ETag`.
pub async fn response_cache_middleware(
    State(gate): State<Arc<ResponseCacheGate>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if !gate.policy.applies_to(&path) {
        return next.run(req).await;
    }

    let has_authorization = req.headers().contains_key(AUTHORIZATION);
    let mut conditional = HeaderMap::new();
    for value in req.headers().get_all(IF_NONE_MATCH) {
        conditional.append(IF_NONE_MATCH, value.clone());
    }

    let on_graphql_path = gate.policy.is_graphql_path(&path);
    let (operation, req) = if detect::needs_body(req.method(), on_graphql_path) {
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, gate.body_limit).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, path = %path, "Request body rejected");
                return payload_too_large(gate.body_limit);
            }
        };
        let operation = detect::classify(
            &parts.method,
            on_graphql_path,
            parts.uri.query(),
            Some(&bytes[..]),
        );
        (operation, Request::from_parts(parts, Body::from(bytes)))
    } else {
        let operation = detect::classify(req.method(), on_graphql_path, req.uri().query(), None);
        (operation, req)
    };

    let res = next.run(req).await;

    let input = CacheInput {
        path: &path,
        operation,
        has_authorization,
        status: res.status(),
    };
    let Some(directive) = gate.policy.directive(&input) else {
        return res;
    };
    let Ok(directive_value) = HeaderValue::from_str(&directive) else {
        return res;
    };

    if !allows_validation(&directive) || !res.status().is_success() {
        metrics::record_http_cache_miss();
        let mut res = res;
        res.headers_mut().insert(CACHE_CONTROL, directive_value);
        return res;
    }

    let within_limit = res
        .body()
        .size_hint()
        .upper()
        .is_some_and(|len| len <= gate.body_limit as u64);
    if !within_limit {
        tracing::debug!(path = %path, "Response too large or unsized; sent without ETag");
        metrics::record_http_cache_miss();
        let mut res = res;
        res.headers_mut().insert(CACHE_CONTROL, directive_value);
        return res;
    }

    let (mut parts, body) = res.into_parts();
    let bytes = match axum::body::to_bytes(body, gate.body_limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, path = %path, "Failed to buffer response body");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": "Failed to read response body",
                })),
            )
                .into_response();
        }
    };

    let etag = compute_etag(&bytes);
    let Ok(etag_value) = HeaderValue::from_str(&etag) else {
        parts.headers.insert(CACHE_CONTROL, directive_value);
        return Response::from_parts(parts, Body::from(bytes));
    };

    if if_none_match(&conditional, &etag) {
        metrics::record_http_cache_hit();
        tracing::debug!(path = %path, etag = %etag, operation = ?operation, "Conditional request matched");
        let mut not_modified = Response::new(Body::empty());
        *not_modified.status_mut() = StatusCode::NOT_MODIFIED;
        not_modified.headers_mut().insert(CACHE_CONTROL, directive_value);
        not_modified.headers_mut().insert(ETAG, etag_value);
        return not_modified;
    }

    metrics::record_http_cache_miss();
    parts.headers.insert(CACHE_CONTROL, directive_value);
    parts.headers.insert(ETAG, etag_value);
    if has_authorization {
        parts
            .headers
            .insert(VARY, HeaderValue::from_static("Authorization"));
    }
    Response::from_parts(parts, Body::from(bytes))
}

fn payload_too_large(limit: usize) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({
            "error": "payload_too_large",
            "message": format!("Request body exceeds {limit} bytes"),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheControlSettings;
    use axum::{
        Router,
        middleware::from_fn_with_state,
        routing::{get, post},
    };
    use tower::ServiceExt;

    const LARGE_BODY: &str = r#"{"data":{"concepts":["house","tree","river","mountain"]}}"#;

    fn app(body_limit: usize) -> Router {
        let gate = Arc::new(ResponseCacheGate::new(
            CacheControlPolicy::new(CacheControlSettings::default()),
            body_limit,
        ));
        Router::new()
            .route("/graphql", post(|| async { r#"{"data":{"concepts":[]}}"# }))
            .route("/api/languages", get(|| async { "[\"en\",\"fr\"]" }))
            .route("/api/export", get(|| async { LARGE_BODY }))
            .layer(from_fn_with_state(gate, response_cache_middleware))
    }

    fn graphql(query: &str) -> Request<Body> {
        Request::post("/graphql")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "query": query }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn mutations_are_never_cached() {
        let res = app(1024)
            .oneshot(graphql("mutation { addConcept { id } }"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get(CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert!(res.headers().get(ETAG).is_none());
    }

    #[tokio::test]
    async fn large_responses_pass_through_without_etag() {
        let res = app(16)
            .oneshot(Request::get("/api/export").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get(CACHE_CONTROL).unwrap(), "public, max-age=300");
        assert!(res.headers().get(ETAG).is_none());
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], LARGE_BODY.as_bytes());

        let res = app(1024)
            .oneshot(Request::get("/api/export").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.headers().get(ETAG).is_some());
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let res = app(16)
            .oneshot(graphql("query { concepts { id name translations } }"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
