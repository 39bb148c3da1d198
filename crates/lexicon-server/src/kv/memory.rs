//! In-process store with per-key expiry.
//!
//! Uses `tokio::time::Instant` so expiry follows the runtime clock (and can be
//! driven by a paused clock in tests).

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{KeyTtl, KvStore};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Single-instance key/value store backed by `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an expired entry so lookups see it as missing.
    fn evict_if_expired(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.evict_if_expired(key, now);
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        true
    }

    async fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now))
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.evict_if_expired(key, now);
        self.entries.contains_key(key)
    }

    async fn ttl(&self, key: &str) -> KeyTtl {
        let now = Instant::now();
        self.evict_if_expired(key, now);
        match self.entries.get(key) {
            None => KeyTtl::Missing,
            Some(entry) => match entry.expires_at {
                None => KeyTtl::Persistent,
                // A live key never reports 0 seconds.
                Some(at) => KeyTtl::Expires(at.saturating_duration_since(now).as_secs().max(1)),
            },
        }
    }

    async fn increment(&self, key: &str, by: i64) -> Option<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".into(),
                expires_at: None,
            });
        if entry.is_expired(now) {
            *entry = MemoryEntry {
                value: "0".into(),
                expires_at: None,
            };
        }
        let current: i64 = entry.value.parse().ok()?;
        let next = current.checked_add(by)?;
        entry.value = next.to_string();
        Some(next)
    }

    async fn expire(&self, key: &str, seconds: u64) -> bool {
        let now = Instant::now();
        self.evict_if_expired(key, now);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
                true
            }
            None => false,
        }
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Redis `MATCH` glob: `*`, `?`, `[abc]`, `[^a-z]` and backslash escapes.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
            continue;
        }
        if pi < p.len() {
            let (matched, next) = match_one(&p, pi, t[ti]);
            if matched {
                pi = next;
                ti += 1;
                continue;
            }
        }
        match star {
            // Let the last star absorb one more character.
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Match one non-star pattern element at `pi` against `c`, returning whether
/// it matched and where the next element starts.
fn match_one(p: &[char], pi: usize, c: char) -> (bool, usize) {
    match p[pi] {
        '?' => (true, pi + 1),
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c, pi + 2),
        '[' => match class_end(p, pi) {
            Some(end) => (class_matches(&p[pi + 1..end], c), end + 1),
            // Unterminated class: a literal bracket.
            None => (c == '[', pi + 1),
        },
        literal => (literal == c, pi + 1),
    }
}

fn class_end(p: &[char], open: usize) -> Option<usize> {
    let mut i = open + 1;
    while i < p.len() {
        match p[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn class_matches(class: &[char], c: char) -> bool {
    let (negated, class) = match class.first() {
        Some('^') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut hit = false;
    let mut i = 0;
    while i < class.len() {
        if class[i] == '\\' && i + 1 < class.len() {
            hit |= class[i + 1] == c;
            i += 2;
        } else if i + 2 < class.len() && class[i + 1] == '-' {
            let (lo, hi) = if class[i] <= class[i + 2] {
                (class[i], class[i + 2])
            } else {
                (class[i + 2], class[i])
            };
            hit |= lo <= c && c <= hi;
            i += 3;
        } else {
            hit |= class[i] == c;
            i += 1;
        }
    }
    hit != negated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_like_redis() {
        assert!(glob_match("cache:*", "cache:concepts:list:abc"));
        assert!(glob_match("cache:concepts:*", "cache:concepts:get:1"));
        assert!(!glob_match("cache:concepts:*", "cache:languages:get:1"));
        assert!(glob_match("rate_limit:?p:*", "rate_limit:ip:10.0.0.1:/graphql"));
        assert!(glob_match("*", ""));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn glob_supports_classes_and_escapes() {
        assert!(glob_match("cache:[cl]*", "cache:concepts:get:1"));
        assert!(glob_match("cache:[cl]*", "cache:languages:all:c3"));
        assert!(!glob_match("cache:[cl]*", "cache:terms:get:1"));
        assert!(glob_match("cache:[^c]*", "cache:terms:get:1"));
        assert!(!glob_match("cache:[^c]*", "cache:concepts:get:1"));
        assert!(glob_match("v[0-9]", "v7"));
        assert!(!glob_match("v[0-9]", "vx"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("a\\?", "a?"));
        assert!(!glob_match("a\\?", "ab"));
        assert!(glob_match("x[", "x["));
    }

    #[tokio::test]
    async fn scan_honours_character_classes() {
        let store = MemoryStore::new();
        for key in ["cache:concepts:a", "cache:languages:b", "cache:terms:c"] {
            store.set(key, "1", None).await;
        }
        let mut keys = store.scan("cache:[cl]*").await;
        keys.sort();
        assert_eq!(keys, vec!["cache:concepts:a", "cache:languages:b"]);
    }

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        assert!(store.set("k", "v", None).await);
        assert_eq!(store.get("k").await.as_deref(), Some("v"));
        assert!(store.exists("k").await);
        assert_eq!(store.ttl("k").await, KeyTtl::Persistent);
        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
        assert_eq!(store.get("k").await, None);
        assert_eq!(store.ttl("k").await, KeyTtl::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_the_runtime_clock() {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(10))).await;
        assert_eq!(store.ttl("k").await, KeyTtl::Expires(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await, None);
        assert!(!store.exists("k").await);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn increment_creates_and_restarts_after_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("n", 1).await, Some(1));
        assert!(store.expire("n", 5).await);
        assert_eq!(store.increment("n", 2).await, Some(3));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.increment("n", 1).await, Some(1));
        assert_eq!(store.ttl("n").await, KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn increment_rejects_non_integers() {
        let store = MemoryStore::new();
        store.set("text", "hello", None).await;
        assert_eq!(store.increment("text", 1).await, None);
    }

    #[tokio::test]
    async fn expire_on_missing_key_is_false() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", 10).await);
    }

    #[tokio::test]
    async fn scan_filters_by_pattern() {
        let store = MemoryStore::new();
        store.set("cache:a:op:1", "1", None).await;
        store.set("cache:b:op:2", "2", None).await;
        store.set("rate_limit:ip:x:/", "1", None).await;

        let mut keys = store.scan("cache:*").await;
        keys.sort();
        assert_eq!(keys, vec!["cache:a:op:1", "cache:b:op:2"]);
    }
}
