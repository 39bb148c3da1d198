//! Read/write classification for the single GraphQL endpoint.
//!
//! A GraphQL request always arrives on the same path, so the HTTP method alone
//! cannot tell a query from a mutation. The operation text decides.

use axum::http::Method;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

const MUTATION_KEYWORD: &str = "mutation";

/// `true` when the operation text starts with the mutation keyword.
/// Named queries (`query ...`) and the shorthand form (`{ ... }`) are reads.
pub fn is_mutation(query: &str) -> bool {
    query.trim().to_lowercase().starts_with(MUTATION_KEYWORD)
}

/// Classify a JSON request body. Anything that cannot be read as a GraphQL
/// request counts as a write so it is never cached.
pub fn classify_body(body: &[u8]) -> OperationKind {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable request body treated as write");
            return OperationKind::Write;
        }
    };

    match parsed {
        Value::Object(_) => classify_document(&parsed),
        // Batched requests are writes if any entry is.
        Value::Array(entries) if !entries.is_empty() => {
            if entries
                .iter()
                .any(|entry| classify_document(entry) == OperationKind::Write)
            {
                OperationKind::Write
            } else {
                OperationKind::Read
            }
        }
        _ => OperationKind::Write,
    }
}

fn classify_document(document: &Value) -> OperationKind {
    let Some(object) = document.as_object() else {
        return OperationKind::Write;
    };
    // Persisted queries and other bodies without operation text cannot be
    // inspected.
    match object.get("query") {
        Some(Value::String(query)) if is_mutation(query) => OperationKind::Write,
        Some(Value::String(_)) => OperationKind::Read,
        _ => OperationKind::Write,
    }
}

/// Classify a GET request by its `query` parameter, if any.
pub fn classify_query_string(query_string: &str) -> OperationKind {
    let is_write = url::form_urlencoded::parse(query_string.as_bytes())
        .any(|(name, value)| name == "query" && is_mutation(&value));
    if is_write {
        OperationKind::Write
    } else {
        OperationKind::Read
    }
}

/// Whether the body must be inspected to classify a request. Only POSTs to
/// the GraphQL endpoint can be reads.
pub fn needs_body(method: &Method, on_graphql_path: bool) -> bool {
    on_graphql_path && method == Method::POST
}

/// Classify a request from its method, target and (for GraphQL POSTs) body.
/// A POST anywhere else creates or changes something and is a write.
pub fn classify(
    method: &Method,
    on_graphql_path: bool,
    query_string: Option<&str>,
    body: Option<&[u8]>,
) -> OperationKind {
    match *method {
        Method::GET | Method::HEAD | Method::OPTIONS => query_string
            .map(classify_query_string)
            .unwrap_or(OperationKind::Read),
        Method::POST if on_graphql_path => body.map(classify_body).unwrap_or(OperationKind::Write),
        _ => OperationKind::Write,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_keyword_detected_case_insensitively() {
        assert!(is_mutation("mutation { createConcept(name: \"x\") { id } }"));
        assert!(is_mutation("  \n MUTATION AddTerm { addTerm { id } }"));
        assert!(!is_mutation("query { concepts { id } }"));
        assert!(!is_mutation("{ concepts { id } }"));
    }

    #[test]
    fn bodies_are_classified() {
        assert_eq!(
            classify_body(br#"{"query": "mutation { deleteConcept(id: 1) }"}"#),
            OperationKind::Write
        );
        assert_eq!(
            classify_body(br#"{"query": "query Concepts { concepts { id } }", "variables": {}}"#),
            OperationKind::Read
        );
        assert_eq!(classify_body(br#"{"query": "{ languages { code } }"}"#), OperationKind::Read);
    }

    #[test]
    fn unparseable_bodies_are_writes() {
        assert_eq!(classify_body(b"not json"), OperationKind::Write);
        assert_eq!(classify_body(b""), OperationKind::Write);
        assert_eq!(classify_body(br#""just a string""#), OperationKind::Write);
        assert_eq!(classify_body(br#"{"query": 12}"#), OperationKind::Write);
    }

    #[test]
    fn bodies_without_operation_text_are_writes() {
        assert_eq!(
            classify_body(br#"{"extensions": {"persistedQuery": {"version": 1}}}"#),
            OperationKind::Write
        );
        assert_eq!(classify_body(br#"{"query": null}"#), OperationKind::Write);
        assert_eq!(classify_body(br#"[{"query": "{ a }"}, {"id": "abc"}]"#), OperationKind::Write);
    }

    #[test]
    fn batches_with_any_mutation_are_writes() {
        let batch = br#"[{"query": "{ a }"}, {"query": "mutation { b }"}]"#;
        assert_eq!(classify_body(batch), OperationKind::Write);
        let reads = br#"[{"query": "{ a }"}, {"query": "query { b }"}]"#;
        assert_eq!(classify_body(reads), OperationKind::Read);
    }

    #[test]
    fn get_requests_inspect_the_query_parameter() {
        assert_eq!(
            classify(&Method::GET, true, Some("query=mutation%20%7B%20x%20%7D"), None),
            OperationKind::Write
        );
        assert_eq!(
            classify(&Method::GET, true, Some("query=%7B%20x%20%7D"), None),
            OperationKind::Read
        );
        assert_eq!(classify(&Method::GET, false, None, None), OperationKind::Read);
    }

    #[test]
    fn other_methods_are_writes() {
        assert_eq!(classify(&Method::DELETE, false, None, None), OperationKind::Write);
        assert_eq!(classify(&Method::PUT, true, None, Some(&b"{}"[..])), OperationKind::Write);
        assert_eq!(classify(&Method::POST, true, None, None), OperationKind::Write);
    }

    #[test]
    fn posts_off_the_graphql_path_are_writes() {
        let read = br#"{"query": "{ concepts { id } }"}"#;
        assert_eq!(classify(&Method::POST, true, None, Some(&read[..])), OperationKind::Read);
        assert_eq!(classify(&Method::POST, false, None, Some(&read[..])), OperationKind::Write);
        assert!(!needs_body(&Method::POST, false));
        assert!(needs_body(&Method::POST, true));
        assert!(!needs_body(&Method::GET, true));
    }
}
