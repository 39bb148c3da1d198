//! Content fingerprints and conditional request matching.

use std::hash::{DefaultHasher, Hasher};

use axum::http::{HeaderMap, header};

/// Quoted fingerprint of a response body.
///
/// Uses the std SipHash with fixed keys, so identical bytes produce identical
/// tags across requests and across instances running the same build.
pub fn compute_etag(body: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    hasher.write(body);
    format!("\"{:016x}\"", hasher.finish())
}

/// Check `If-None-Match` against `etag`.
///
/// Honors comma-separated lists, weak validators (`W/"..."`) and `*`.
pub fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .any(|candidate| {
            candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn identical_bodies_share_a_tag() {
        let a = compute_etag(br#"{"data":{"concepts":[]}}"#);
        let b = compute_etag(br#"{"data":{"concepts":[]}}"#);
        let c = compute_etag(br#"{"data":{"concepts":[1]}}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn matches_lists_weak_tags_and_wildcard() {
        let tag = compute_etag(b"body");
        let mut headers = HeaderMap::new();
        headers.insert(
            header::IF_NONE_MATCH,
            HeaderValue::from_str(&format!("\"other\", W/{tag}")).unwrap(),
        );
        assert!(if_none_match(&headers, &tag));

        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"other\""));
        assert!(!if_none_match(&headers, &tag));

        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match(&headers, &tag));

        assert!(!if_none_match(&HeaderMap::new(), &tag));
    }
}
