//! Cache-Control decision table.

use axum::http::StatusCode;

use crate::config::CacheControlSettings;

use super::detect::OperationKind;

/// Directive for responses that must never be reused.
pub const NO_STORE: &str = "no-cache, no-store, must-revalidate";
/// Directive for liveness/readiness answers.
pub const NO_CACHE: &str = "no-cache";

/// Everything the decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct CacheInput<'a> {
    pub path: &'a str,
    pub operation: OperationKind,
    pub has_authorization: bool,
    pub status: StatusCode,
}

#[derive(Debug, Clone)]
pub struct CacheControlPolicy {
    settings: CacheControlSettings,
}

impl CacheControlPolicy {
    pub fn new(settings: CacheControlSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CacheControlSettings {
        &self.settings
    }

    /// `false` when responses on `path` pass through untouched.
    pub fn applies_to(&self, path: &str) -> bool {
        self.settings.enabled
            && !self
                .settings
                .excluded_paths
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn is_graphql_path(&self, path: &str) -> bool {
        path == self.settings.graphql_path
    }

    fn is_health_path(&self, path: &str) -> bool {
        self.settings
            .health_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// The `Cache-Control` value for a response, or `None` to leave it alone.
    pub fn directive(&self, input: &CacheInput<'_>) -> Option<String> {
        if !self.applies_to(input.path) {
            return None;
        }
        if input.status.as_u16() >= 400 || input.operation == OperationKind::Write {
            return Some(NO_STORE.to_string());
        }
        if self.is_health_path(input.path) {
            return Some(NO_CACHE.to_string());
        }
        if input.has_authorization {
            return Some(format!("private, max-age={}", self.settings.query_max_age));
        }
        let max_age = if self.is_graphql_path(input.path) {
            self.settings.query_max_age
        } else {
            self.settings.default_max_age
        };
        Some(format!("public, max-age={max_age}"))
    }
}

/// Whether a directive permits validators (ETag, 304).
pub fn allows_validation(directive: &str) -> bool {
    !directive.contains("no-cache") && !directive.contains("no-store")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CacheControlPolicy {
        CacheControlPolicy::new(CacheControlSettings {
            query_max_age: 60,
            default_max_age: 300,
            ..CacheControlSettings::default()
        })
    }

    fn input(path: &str, operation: OperationKind, auth: bool, status: u16) -> CacheInput<'_> {
        CacheInput {
            path,
            operation,
            has_authorization: auth,
            status: StatusCode::from_u16(status).unwrap(),
        }
    }

    #[test]
    fn decision_table() {
        let p = policy();
        let read = OperationKind::Read;
        let write = OperationKind::Write;

        assert_eq!(p.directive(&input("/admin/cache", read, false, 200)), None);
        assert_eq!(p.directive(&input("/metrics", read, false, 200)), None);
        assert_eq!(
            p.directive(&input("/graphql", read, false, 500)).as_deref(),
            Some(NO_STORE)
        );
        assert_eq!(
            p.directive(&input("/graphql", read, true, 404)).as_deref(),
            Some(NO_STORE)
        );
        assert_eq!(
            p.directive(&input("/graphql", write, false, 200)).as_deref(),
            Some(NO_STORE)
        );
        assert_eq!(
            p.directive(&input("/api/concepts", write, true, 200)).as_deref(),
            Some(NO_STORE)
        );
        assert_eq!(
            p.directive(&input("/healthz", read, false, 200)).as_deref(),
            Some(NO_CACHE)
        );
        assert_eq!(
            p.directive(&input("/graphql", read, true, 200)).as_deref(),
            Some("private, max-age=60")
        );
        assert_eq!(
            p.directive(&input("/graphql", read, false, 200)).as_deref(),
            Some("public, max-age=60")
        );
        assert_eq!(
            p.directive(&input("/api/languages", read, false, 200)).as_deref(),
            Some("public, max-age=300")
        );
    }

    #[test]
    fn disabled_gate_leaves_everything_alone() {
        let p = CacheControlPolicy::new(CacheControlSettings {
            enabled: false,
            ..CacheControlSettings::default()
        });
        assert!(!p.applies_to("/graphql"));
        assert_eq!(
            p.directive(&input("/graphql", OperationKind::Write, false, 500)),
            None
        );
    }

    #[test]
    fn validators_only_for_reusable_directives() {
        assert!(allows_validation("public, max-age=60"));
        assert!(allows_validation("private, max-age=60"));
        assert!(!allows_validation(NO_STORE));
        assert!(!allows_validation(NO_CACHE));
    }
}
