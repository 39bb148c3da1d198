//! Request governance for the Lexicon dictionary API: rate limiting, HTTP
//! response caching and service result caching over a shared fail-open
//! key/value store.

pub mod config;
pub mod context;
pub mod handlers;
pub mod identity;
pub mod kv;
pub mod metrics;
pub mod observability;
pub mod proxy;
pub mod rate_limit;
pub mod response_cache;
pub mod server;
pub mod service_cache;

pub use context::RequestContext;
pub use server::{GovernanceState, LexiconServer, ServerBuilder, apply_governance, build_app};
