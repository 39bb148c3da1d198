//! Admission control for inbound requests.
//!
//! Counters are keyed `rate_limit:{user|ip}:{identity}:{path}` and expire with
//! the window. Store failures always allow the request.

pub mod limiter;
pub mod middleware;
pub mod policy;

pub use limiter::{COUNTER_PREFIX, RateLimitDecision, RateLimitStatus, RateLimiter, counter_key};
pub use middleware::rate_limit_middleware;
pub use policy::{EndpointPolicy, IdentityKind, RateLimitPolicy, parse_endpoint_limits};
