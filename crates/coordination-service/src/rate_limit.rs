use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(feature = "redis-backend")]
use crate::redis_backend::RedisCoordination;
#[cfg(feature = "redis-backend")]
use std::sync::Arc;
#[cfg(feature = "redis-backend")]
use tracing::warn;

struct WindowCounter {
    count: u64,
    window_started: DateTime<Utc>,
    window: Duration,
}

impl WindowCounter {
    fn window_ends(&self) -> DateTime<Utc> {
        self.window_started + chrono::Duration::milliseconds(self.window.as_millis() as i64)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.window_ends() <= now
    }
}

/// Result of one admission check; carries everything the HTTP layer needs
/// for the `X-RateLimit-*` headers and `Retry-After`.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window resets.
    pub reset_at_ms: i64,
    /// Time until the window resets; the Retry-After value when rejected.
    pub retry_after_ms: i64,
    pub count: u64,
}

/// Fixed-window request counter.
///
/// With the `redis-backend` feature and a configured backend, counters
/// live in Redis (INCR + PEXPIRE) and are shared across nodes. Failures
/// of the backing store never reject traffic: the check fails open and
/// bumps a metric instead.
#[derive(Default)]
pub struct RateLimiter {
    counters: DashMap<String, WindowCounter>,
    failed_checks: AtomicU64,
    #[cfg(feature = "redis-backend")]
    redis: Option<Arc<RedisCoordination>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "redis-backend")]
    pub fn with_redis(redis: Arc<RedisCoordination>) -> Self {
        Self {
            redis: Some(redis),
            ..Self::default()
        }
    }

    /// Atomically count a request for `(bucket_prefix, client_id)` in the
    /// current window and decide admission.
    pub async fn check(
        &self,
        bucket_prefix: &str,
        client_id: &str,
        window_ms: u64,
        max: u64,
    ) -> RateLimitDecision {
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            match redis
                .count_request(bucket_prefix, client_id, window_ms, max)
                .await
            {
                Ok(decision) => return decision,
                Err(e) => {
                    warn!(
                        bucket = bucket_prefix,
                        error = %e,
                        "Rate-limit backend unreachable; failing open"
                    );
                    return self.fail_open(max);
                }
            }
        }
        self.check_local(bucket_prefix, client_id, window_ms, max)
    }

    fn check_local(
        &self,
        bucket_prefix: &str,
        client_id: &str,
        window_ms: u64,
        max: u64,
    ) -> RateLimitDecision {
        let key = format!("{}:{}", bucket_prefix, client_id);
        let now = Utc::now();
        let window = Duration::from_millis(window_ms);

        let mut entry = self.counters.entry(key).or_insert_with(|| WindowCounter {
            count: 0,
            window_started: now,
            window,
        });
        if entry.is_expired(now) {
            entry.count = 0;
            entry.window_started = now;
            entry.window = window;
        }
        entry.count += 1;

        let count = entry.count;
        let reset_at = entry.window_ends();
        drop(entry);

        let retry_after_ms = (reset_at - now).num_milliseconds().max(0);
        RateLimitDecision {
            allowed: count <= max,
            limit: max,
            remaining: max.saturating_sub(count),
            reset_at_ms: reset_at.timestamp_millis(),
            retry_after_ms,
            count,
        }
    }

    /// A decision that admits the request unconditionally; used when the
    /// backing store is unreachable.
    pub fn fail_open(&self, max: u64) -> RateLimitDecision {
        self.failed_checks.fetch_add(1, Ordering::Relaxed);
        RateLimitDecision {
            allowed: true,
            limit: max,
            remaining: max,
            reset_at_ms: Utc::now().timestamp_millis(),
            retry_after_ms: 0,
            count: 0,
        }
    }

    /// Checks that failed open because of backend errors.
    pub fn failed_check_count(&self) -> u64 {
        self.failed_checks.load(Ordering::Relaxed)
    }

    /// Drop counters for windows that have already ended.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before - self.counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_max_then_rejects() {
        let limiter = RateLimiter::new();
        for i in 1..=100 {
            let decision = limiter.check("workflows", "client-1", 60_000, 100).await;
            assert!(decision.allowed, "request {} should be admitted", i);
            assert_eq!(decision.remaining, 100 - i);
        }
        let decision = limiter.check("workflows", "client-1", 60_000, 100).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn buckets_and_clients_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check("workflows", "client-1", 60_000, 3).await;
        }
        assert!(!limiter.check("workflows", "client-1", 60_000, 3).await.allowed);
        assert!(limiter.check("workflows", "client-2", 60_000, 3).await.allowed);
        assert!(limiter.check("executions", "client-1", 60_000, 3).await.allowed);
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let limiter = RateLimiter::new();
        assert!(!limiter.check("b", "c", 0, 0).await.allowed);
        // Zero-length window: the next check starts a fresh window.
        let decision = limiter.check("b", "c", 60_000, 1).await;
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);
    }

    #[test]
    fn fail_open_admits_and_counts() {
        let limiter = RateLimiter::new();
        let decision = limiter.fail_open(10);
        assert!(decision.allowed);
        assert_eq!(limiter.failed_check_count(), 1);
    }

    #[test]
    fn sweep_drops_finished_windows() {
        let limiter = RateLimiter::new();
        limiter.check_local("b", "ended", 0, 5);
        limiter.check_local("b", "live", 60_000, 5);
        assert_eq!(limiter.sweep(), 1);
    }
}
