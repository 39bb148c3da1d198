//! HTTP response caching: Cache-Control policy, ETag fingerprints and
//! conditional requests.

pub mod detect;
pub mod etag;
pub mod middleware;
pub mod policy;

pub use detect::OperationKind;
pub use etag::{compute_etag, if_none_match};
pub use middleware::{ResponseCacheGate, response_cache_middleware};
pub use policy::{CacheControlPolicy, CacheInput, NO_CACHE, NO_STORE, allows_validation};
