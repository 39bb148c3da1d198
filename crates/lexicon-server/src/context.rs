//! Request-scoped context handed explicitly to every governance call.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::identity::IdentityExtractor;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Who is calling, from where, and for what.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Numeric identity from a valid bearer token
    pub identity: Option<u64>,
    /// Resolved client address (forwarded chain, real-ip header, peer)
    pub client_addr: String,
    pub method: Method,
    pub path: String,
    /// An `Authorization` header was sent, valid or not
    pub has_authorization: bool,
}

impl RequestContext {
    /// Context for work that does not originate from an HTTP request
    /// (background jobs, warm-up tasks).
    pub fn detached() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            identity: None,
            client_addr: "internal".into(),
            method: Method::GET,
            path: String::new(),
            has_authorization: false,
        }
    }

    /// Build the context from a request's parts.
    pub fn from_request_parts(
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        extractor: &dyn IdentityExtractor,
    ) -> Self {
        let authorization = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok());
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request_id,
            identity: authorization.and_then(|value| extractor.identity(value)),
            client_addr: client_addr(headers, peer),
            method: method.clone(),
            path: path.to_string(),
            has_authorization: headers.contains_key(AUTHORIZATION),
        }
    }
}

/// Resolve the client address: first hop of `X-Forwarded-For`, then
/// `X-Real-IP`, then the socket peer.
pub fn client_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty());
    if let Some(hop) = forwarded {
        return hop.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware that builds the `RequestContext`, stores it in request
/// extensions and mirrors the request id on the response.
pub async fn request_context(
    State(extractor): State<Arc<dyn IdentityExtractor>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ctx = RequestContext::from_request_parts(
        req.method(),
        req.uri().path(),
        req.headers(),
        peer,
        extractor.as_ref(),
    );
    let request_id = HeaderValue::from_str(&ctx.request_id).ok();

    req.extensions_mut().insert(ctx);
    let mut res = next.run(req).await;

    if let Some(value) = request_id {
        res.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AnonymousOnly;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn forwarded_for_first_hop_wins() {
        let h = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        assert_eq!(client_addr(&h, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn real_ip_then_peer() {
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_addr(&h, Some(peer)), "198.51.100.2");
        assert_eq!(client_addr(&HeaderMap::new(), Some(peer)), "192.0.2.1");
        assert_eq!(client_addr(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn context_keeps_incoming_request_id() {
        let h = headers(&[("x-request-id", "abc-123"), ("authorization", "Bearer x")]);
        let ctx =
            RequestContext::from_request_parts(&Method::POST, "/graphql", &h, None, &AnonymousOnly);
        assert_eq!(ctx.request_id, "abc-123");
        assert!(ctx.has_authorization);
        assert_eq!(ctx.identity, None);
        assert_eq!(ctx.path, "/graphql");
    }
}
