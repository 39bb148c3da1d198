//! Cache key layout: `{prefix}:{namespace}:{operation}:{hash}`.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively sort object keys so logically equal arguments serialize to
/// the same bytes regardless of field or insertion order.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Hex SHA-256 of the arguments' canonical JSON form.
pub fn args_hash<A: Serialize + ?Sized>(args: &A) -> Result<String, serde_json::Error> {
    let canonical = canonicalize(serde_json::to_value(args)?);
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn entry_key(prefix: &str, namespace: &str, operation: &str, hash: &str) -> String {
    format!("{prefix}:{namespace}:{operation}:{hash}")
}

/// Anchor a caller-supplied pattern under `prefix` unless it already is.
pub fn scoped_pattern(prefix: &str, pattern: &str) -> String {
    if pattern.starts_with(&format!("{prefix}:")) {
        pattern.to_string()
    } else {
        format!("{prefix}:{pattern}")
    }
}

/// Grouping segment used by stats: the namespace right after the prefix.
pub fn namespace_of<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix(':')?
        .split(':')
        .next()
        .filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn hash_ignores_key_order() {
        let mut a = HashMap::new();
        a.insert("language", "fr");
        a.insert("term", "maison");
        let b = json!({"term": "maison", "language": "fr"});
        assert_eq!(args_hash(&a).unwrap(), args_hash(&b).unwrap());
        assert_ne!(
            args_hash(&b).unwrap(),
            args_hash(&json!({"term": "maison", "language": "de"})).unwrap()
        );
    }

    #[test]
    fn nested_objects_are_sorted() {
        let value = canonicalize(json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]}));
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn patterns_are_scoped_once() {
        assert_eq!(scoped_pattern("cache", "concepts:*"), "cache:concepts:*");
        assert_eq!(scoped_pattern("cache", "cache:concepts:*"), "cache:concepts:*");
        assert_eq!(scoped_pattern("cache", "*"), "cache:*");
    }

    #[test]
    fn namespace_is_the_first_segment_after_the_prefix() {
        assert_eq!(namespace_of("cache", "cache:concepts:list:ab12"), Some("concepts"));
        assert_eq!(namespace_of("cache", "rate_limit:ip:1:/a"), None);
        assert_eq!(namespace_of("cache", "cache:"), None);
    }
}
