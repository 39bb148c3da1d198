//! Fixed-window admission control over KV counters.

use crate::context::RequestContext;
use crate::kv::{KeyTtl, SharedKvStore};
use crate::metrics;

use super::policy::{IdentityKind, RateLimitPolicy};

/// Counter key prefix. Operational tooling relies on it staying stable.
pub const COUNTER_PREFIX: &str = "rate_limit";

/// Values reported to the client on every counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Unix timestamp (seconds) at which the window resets
    pub reset_at: i64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Limiter disabled, path excluded or client whitelisted; nothing counted.
    Bypassed,
    Allowed(RateLimitStatus),
    Denied {
        status: RateLimitStatus,
        /// Seconds until the window resets, always positive
        retry_after: u64,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateLimitDecision::Denied { .. })
    }

    pub fn status(&self) -> Option<RateLimitStatus> {
        match self {
            RateLimitDecision::Bypassed => None,
            RateLimitDecision::Allowed(status) => Some(*status),
            RateLimitDecision::Denied { status, .. } => Some(*status),
        }
    }
}

pub fn counter_key(kind: IdentityKind, subject: &str, path: &str) -> String {
    format!("{COUNTER_PREFIX}:{}:{subject}:{path}", kind.key_segment())
}

/// Admission control shared by every request task.
///
/// Holds no mutable state; counters live in the KV store and rely on its
/// atomic increment. Windows roll by key expiry, so a burst straddling two
/// windows can see up to twice the limit.
pub struct RateLimiter {
    kv: SharedKvStore,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(kv: SharedKvStore, policy: RateLimitPolicy) -> Self {
        Self { kv, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Decide whether the request described by `ctx` may proceed.
    ///
    /// Never fails: an unreachable store or an unreadable counter allows the
    /// request.
    pub async fn check(&self, ctx: &RequestContext) -> RateLimitDecision {
        if !self.policy.enabled
            || self.policy.is_excluded(&ctx.path)
            || self.policy.is_whitelisted(&ctx.client_addr)
        {
            metrics::record_rate_limit("bypassed", "any");
            return RateLimitDecision::Bypassed;
        }

        let kind = if ctx.identity.is_some() {
            IdentityKind::Authenticated
        } else {
            IdentityKind::Anonymous
        };
        let subject = match ctx.identity {
            Some(id) => id.to_string(),
            None => ctx.client_addr.clone(),
        };
        let limit = self.policy.limit_for(&ctx.path, kind);
        let key = counter_key(kind, &subject, &ctx.path);
        let now = now_unix();

        let current = match self.kv.get(&key).await {
            None => None,
            Some(raw) => match raw.parse::<u64>() {
                Ok(count) => Some(count),
                Err(_) => {
                    tracing::warn!(
                        key = %key,
                        value = %raw,
                        request_id = %ctx.request_id,
                        "Rate limit counter is not an integer; allowing request"
                    );
                    return self.fail_open(kind, limit, now);
                }
            },
        };

        if let Some(count) = current
            && count >= limit
        {
            return self.deny(&key, kind, limit, now, ctx).await;
        }

        let Some(count) = self.kv.increment(&key, 1).await else {
            return self.fail_open(kind, limit, now);
        };
        let count = u64::try_from(count).unwrap_or(0);

        let reset_in = if current.is_none() {
            // First request of a window. Concurrent first requests may both
            // land here; the TTL they set is identical.
            self.kv.expire(&key, self.policy.window_secs).await;
            self.policy.window_secs
        } else {
            self.remaining_window(&key).await
        };

        // A concurrent request may have taken the last slot between the read
        // and the increment.
        if count > limit {
            return self.deny(&key, kind, limit, now, ctx).await;
        }

        metrics::record_rate_limit("allowed", kind.as_str());
        RateLimitDecision::Allowed(RateLimitStatus {
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: now + reset_in as i64,
        })
    }

    async fn deny(
        &self,
        key: &str,
        kind: IdentityKind,
        limit: u64,
        now: i64,
        ctx: &RequestContext,
    ) -> RateLimitDecision {
        let retry_after = self.remaining_window(key).await.max(1);
        tracing::info!(
            key = %key,
            limit,
            retry_after,
            request_id = %ctx.request_id,
            client = %ctx.client_addr,
            "Rate limit exceeded"
        );
        metrics::record_rate_limit("denied", kind.as_str());
        RateLimitDecision::Denied {
            status: RateLimitStatus {
                limit,
                remaining: 0,
                reset_at: now + retry_after as i64,
            },
            retry_after,
        }
    }

    fn fail_open(&self, kind: IdentityKind, limit: u64, now: i64) -> RateLimitDecision {
        metrics::record_rate_limit("fail_open", kind.as_str());
        RateLimitDecision::Allowed(RateLimitStatus {
            limit,
            remaining: limit.saturating_sub(1),
            reset_at: now + self.policy.window_secs as i64,
        })
    }

    /// Seconds left in the counter's window. A counter that lost its TTL gets
    /// it back so it cannot block a client forever.
    async fn remaining_window(&self, key: &str) -> u64 {
        match self.kv.ttl(key).await {
            KeyTtl::Expires(secs) => secs,
            KeyTtl::Persistent => {
                self.kv.expire(key, self.policy.window_secs).await;
                self.policy.window_secs
            }
            // Expired between the read and now; the next request starts fresh.
            KeyTtl::Missing => 1,
        }
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
