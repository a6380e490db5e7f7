//! # backlog-providers
//!
//! Outbound calls to third-party media data providers.
//!
//! - Rate limiter factory with a process-local store and a shared Redis store
//! - `MediaProvider` client contract with HTTP and static implementations
//! - Rate-limited provider wrapper and a media-type keyed registry

pub mod http;
pub mod provider;
pub mod rate_limit;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod registry;
pub mod store;

pub use http::HttpProvider;
pub use provider::{MediaProvider, MediaType, ProviderError, RateLimitedProvider, StaticProvider};
pub use rate_limit::{
    LimiterError, LimiterSettings, RateLimitState, RateLimiter, RateLimiterConfig,
    RateLimiterFactory,
};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use registry::{ProviderConfig, ProviderRegistry};
pub use store::{Consumption, LimiterStore, MemoryStore};
