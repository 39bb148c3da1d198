//! Identity extraction from already-issued bearer tokens.
//!
//! The governance layer never authenticates anyone. It only needs a stable
//! numeric identity to key per-user counters, and treats any token it cannot
//! read as anonymous.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::Value;

/// Maps an `Authorization` header value to a numeric identity.
pub trait IdentityExtractor: Send + Sync {
    fn identity(&self, authorization: &str) -> Option<u64>;
}

/// Extractor that never recognises anyone; used when no secret is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousOnly;

impl IdentityExtractor for AnonymousOnly {
    fn identity(&self, _authorization: &str) -> Option<u64> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct IdentityClaims {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    user_id: Option<Value>,
}

/// Decodes HS256 access tokens and reads a numeric `user_id` or `sub` claim.
pub struct JwtIdentityExtractor {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityExtractor {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityExtractor for JwtIdentityExtractor {
    fn identity(&self, authorization: &str) -> Option<u64> {
        let token = authorization.strip_prefix("Bearer ")?.trim();
        if token.is_empty() {
            return None;
        }
        match decode::<IdentityClaims>(token, &self.key, &self.validation) {
            Ok(data) => {
                let claims = data.claims;
                claims
                    .user_id
                    .as_ref()
                    .and_then(numeric_claim)
                    .or_else(|| claims.sub.as_ref().and_then(numeric_claim))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Bearer token not usable for rate limiting identity");
                None
            }
        }
    }
}

/// Accept both `42` and `"42"`.
fn numeric_claim(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn token(claims: Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        4_102_444_800 // 2100-01-01
    }

    #[test]
    fn reads_numeric_user_id_claim() {
        let extractor = JwtIdentityExtractor::new(SECRET);
        let header = format!("Bearer {}", token(json!({"user_id": 7, "exp": far_future()})));
        assert_eq!(extractor.identity(&header), Some(7));
    }

    #[test]
    fn falls_back_to_string_subject() {
        let extractor = JwtIdentityExtractor::new(SECRET);
        let header = format!("Bearer {}", token(json!({"sub": "42", "exp": far_future()})));
        assert_eq!(extractor.identity(&header), Some(42));
    }

    #[test]
    fn rejects_wrong_secret_and_garbage() {
        let extractor = JwtIdentityExtractor::new("other-secret");
        let header = format!("Bearer {}", token(json!({"sub": "42", "exp": far_future()})));
        assert_eq!(extractor.identity(&header), None);
        assert_eq!(extractor.identity("Bearer not-a-token"), None);
        assert_eq!(extractor.identity("Basic dXNlcjpwYXNz"), None);
    }

    #[test]
    fn rejects_expired_tokens() {
        let extractor = JwtIdentityExtractor::new(SECRET);
        let header = format!("Bearer {}", token(json!({"sub": "42", "exp": 1_000_000})));
        assert_eq!(extractor.identity(&header), None);
    }

    #[test]
    fn non_numeric_subject_is_anonymous() {
        let extractor = JwtIdentityExtractor::new(SECRET);
        let header = format!("Bearer {}", token(json!({"sub": "alice", "exp": far_future()})));
        assert_eq!(extractor.identity(&header), None);
    }
}
