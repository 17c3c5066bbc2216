//! Coordination service
//!
//! The shared-state primitives that make concurrent workflow execution
//! safe: a named TTL lock with token-based release, a TTL key/value cache
//! with prefix invalidation, and a fixed-window rate limiter. The default
//! backing is in-process; the `redis-backend` feature swaps in Redis for
//! multi-node deployments.

pub mod cache;
pub mod lock;
pub mod rate_limit;
#[cfg(feature = "redis-backend")]
pub mod redis_backend;

pub use cache::CacheService;
pub use lock::{LockManager, LockToken};
pub use rate_limit::{RateLimitDecision, RateLimiter};
#[cfg(feature = "redis-backend")]
pub use redis_backend::RedisCoordination;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("Lock already held: {0}")]
    AcquisitionFailed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Cache producer failed: {0}")]
    Producer(String),
}
