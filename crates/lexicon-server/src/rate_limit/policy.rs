//! Static rate limit policy: global limits, ordered endpoint overrides,
//! whitelist and exclusions.

use std::net::IpAddr;
use std::str::FromStr;

use indexmap::IndexMap;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde_json::Value;

use crate::config::RateLimitSettings;

/// Whether the caller presented a usable identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Authenticated,
    Anonymous,
}

impl IdentityKind {
    /// Segment used in counter keys.
    pub fn key_segment(self) -> &'static str {
        match self {
            IdentityKind::Authenticated => "user",
            IdentityKind::Anonymous => "ip",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IdentityKind::Authenticated => "authenticated",
            IdentityKind::Anonymous => "anonymous",
        }
    }
}

/// Per-endpoint override, matched against the request path.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    pub pattern: Regex,
    pub authenticated: u64,
    pub anonymous: u64,
}

impl EndpointPolicy {
    pub fn limit_for(&self, kind: IdentityKind) -> u64 {
        match kind {
            IdentityKind::Authenticated => self.authenticated,
            IdentityKind::Anonymous => self.anonymous,
        }
    }
}

#[derive(Debug, Clone)]
enum WhitelistEntry {
    Network(IpNetwork),
    Literal(String),
}

impl WhitelistEntry {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match IpNetwork::from_str(raw) {
            Ok(network) => WhitelistEntry::Network(network),
            Err(_) => WhitelistEntry::Literal(raw.to_string()),
        }
    }

    fn matches(&self, addr: &str, ip: Option<IpAddr>) -> bool {
        match self {
            WhitelistEntry::Network(network) => ip.is_some_and(|ip| network.contains(ip)),
            WhitelistEntry::Literal(literal) => literal == addr,
        }
    }
}

/// Immutable policy compiled once from configuration.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub authenticated_limit: u64,
    pub anonymous_limit: u64,
    pub window_secs: u64,
    endpoints: Vec<EndpointPolicy>,
    whitelist: Vec<WhitelistEntry>,
    excluded_paths: Vec<String>,
}

impl RateLimitPolicy {
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        let endpoints = settings
            .endpoint_limits
            .as_deref()
            .map(|raw| {
                parse_endpoint_limits(
                    raw,
                    settings.authenticated_per_minute,
                    settings.anonymous_per_minute,
                )
            })
            .unwrap_or_default();

        Self {
            enabled: settings.enabled,
            authenticated_limit: settings.authenticated_per_minute,
            anonymous_limit: settings.anonymous_per_minute,
            window_secs: settings.window_secs,
            endpoints,
            whitelist: settings
                .whitelist
                .iter()
                .filter(|entry| !entry.trim().is_empty())
                .map(|entry| WhitelistEntry::parse(entry))
                .collect(),
            excluded_paths: settings.excluded_paths.clone(),
        }
    }

    pub fn endpoints(&self) -> &[EndpointPolicy] {
        &self.endpoints
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn is_whitelisted(&self, client_addr: &str) -> bool {
        let ip = IpAddr::from_str(client_addr).ok();
        self.whitelist
            .iter()
            .any(|entry| entry.matches(client_addr, ip))
    }

    /// First matching endpoint override, else the global limit for `kind`.
    pub fn limit_for(&self, path: &str, kind: IdentityKind) -> u64 {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.pattern.is_match(path))
            .map(|endpoint| endpoint.limit_for(kind))
            .unwrap_or(match kind {
                IdentityKind::Authenticated => self.authenticated_limit,
                IdentityKind::Anonymous => self.anonymous_limit,
            })
    }
}

/// Parse the endpoint override map, keeping the order entries were written.
///
/// Invalid entries are dropped with a warning; a kind missing from an entry
/// falls back to the global limit for that kind.
pub fn parse_endpoint_limits(
    raw: &str,
    default_authenticated: u64,
    default_anonymous: u64,
) -> Vec<EndpointPolicy> {
    let entries: IndexMap<String, Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring rate_limit.endpoint_limits: not a JSON object");
            return Vec::new();
        }
    };

    let mut policies = Vec::with_capacity(entries.len());
    for (pattern, limits) in entries {
        let regex = match Regex::new(&pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Dropping endpoint limit: invalid regex");
                continue;
            }
        };
        let Value::Object(limits) = limits else {
            tracing::warn!(pattern = %pattern, "Dropping endpoint limit: limits must be an object");
            continue;
        };

        let read = |name: &str, fallback: u64| -> Result<u64, ()> {
            match limits.get(name) {
                None => Ok(fallback),
                Some(value) => value.as_u64().filter(|n| *n > 0).ok_or(()),
            }
        };
        match (
            read("authenticated", default_authenticated),
            read("anonymous", default_anonymous),
        ) {
            (Ok(authenticated), Ok(anonymous)) => policies.push(EndpointPolicy {
                pattern: regex,
                authenticated,
                anonymous,
            }),
            _ => {
                tracing::warn!(pattern = %pattern, "Dropping endpoint limit: limits must be positive integers");
            }
        }
    }
    policies
}
