use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::context::RequestContext;
use crate::identity::AnonymousOnly;

use super::limiter::{RateLimitDecision, RateLimitStatus, RateLimiter};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Rate limiting middleware.
///
/// Reads the `RequestContext` placed by the context middleware, rejects with
/// 429 when the caller is over its limit, and attaches the `X-RateLimit-*`
/// headers to every counted response.
///
/// Requests the limiter bypasses (limiter disabled, excluded path,
/// whitelisted client) are never counted and carry no `X-RateLimit-*`
/// headers.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ctx = match req.extensions().get::<RequestContext>() {
        Some(ctx) => ctx.clone(),
        None => {
            let peer = req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            RequestContext::from_request_parts(
                req.method(),
                req.uri().path(),
                req.headers(),
                peer,
                &AnonymousOnly,
            )
        }
    };

    match limiter.check(&ctx).await {
        RateLimitDecision::Bypassed => next.run(req).await,
        RateLimitDecision::Allowed(status) => {
            let mut res = next.run(req).await;
            apply_headers(res.headers_mut(), &status);
            res
        }
        RateLimitDecision::Denied {
            status,
            retry_after,
        } => too_many_requests(&status, retry_after, limiter.policy().window_secs),
    }
}

fn apply_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert(HeaderName::from_static(LIMIT_HEADER), HeaderValue::from(status.limit));
    headers.insert(
        HeaderName::from_static(REMAINING_HEADER),
        HeaderValue::from(status.remaining),
    );
    headers.insert(
        HeaderName::from_static(RESET_HEADER),
        HeaderValue::from(status.reset_at),
    );
}

/// Create a 429 response carrying the retry hint in body and headers.
fn too_many_requests(status: &RateLimitStatus, retry_after: u64, window_secs: u64) -> Response {
    let body = json!({
        "error": "Rate limit exceeded",
        "message": format!(
            "Too many requests: limit is {} per {}s. Try again in {} seconds.",
            status.limit, window_secs, retry_after
        ),
        "retry_after": retry_after,
    });

    let mut res = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_headers(res.headers_mut(), status);
    res.headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after));
    res
}
