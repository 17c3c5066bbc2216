use crate::CoordinationError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[cfg(feature = "redis-backend")]
use crate::redis_backend::RedisCoordination;
#[cfg(feature = "redis-backend")]
use std::sync::Arc;

/// Fencing token returned by a successful acquisition. Release only
/// succeeds while the holder still owns the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(Uuid);

impl LockToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct LockEntry {
    token: LockToken,
    expires_at: Instant,
}

/// Named TTL-bounded mutual exclusion.
///
/// Acquisition is an atomic set-if-absent with expiry; an expired entry is
/// claimable by the next caller. With the `redis-backend` feature and a
/// configured backend, the exclusion spans nodes via SET NX PX; a backend
/// error degrades to process-local exclusion rather than blocking work.
/// The engine serializes every mutation of an execution under
/// `execution:{id}`.
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<String, LockEntry>,
    #[cfg(feature = "redis-backend")]
    redis: Option<Arc<RedisCoordination>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "redis-backend")]
    pub fn with_redis(redis: Arc<RedisCoordination>) -> Self {
        Self {
            locks: DashMap::new(),
            redis: Some(redis),
        }
    }

    /// Try to take the lock. Returns `None` while another holder owns an
    /// unexpired entry; callers must not proceed in that case.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            let token = LockToken::new();
            match redis.acquire(key, &token.to_string(), ttl).await {
                Ok(true) => return Some(token),
                Ok(false) => return None,
                Err(e) => {
                    warn!(key, error = %e, "Redis lock acquire failed; degrading to process-local exclusion");
                }
            }
        }
        self.acquire_local(key, ttl)
    }

    fn acquire_local(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = Instant::now();
        let token = LockToken::new();
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(LockEntry {
                        token,
                        expires_at: now + ttl,
                    });
                    debug!(key, "Lock acquired after TTL expiry of previous holder");
                    Some(token)
                } else {
                    None
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    token,
                    expires_at: now + ttl,
                });
                Some(token)
            }
        }
    }

    /// Release conditional on token match. Returns false when the key is
    /// absent or held by someone else (the TTL passed and another worker
    /// claimed it).
    pub async fn release(&self, key: &str, token: LockToken) -> bool {
        let mut released = self.release_local(key, token);
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            match redis.release(key, &token.to_string()).await {
                Ok(redis_released) => released = released || redis_released,
                Err(e) => warn!(key, error = %e, "Redis lock release failed"),
            }
        }
        released
    }

    fn release_local(&self, key: &str, token: LockToken) -> bool {
        self.locks
            .remove_if(key, |_, entry| entry.token == token)
            .is_some()
    }

    /// Run `f` while holding the lock, releasing on every exit path.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<T, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = self
            .acquire(key, ttl)
            .await
            .ok_or_else(|| CoordinationError::AcquisitionFailed(key.to_string()))?;
        let result = f().await;
        if !self.release(key, token).await {
            warn!(key, "Lock expired before release; work may have exceeded the TTL");
        }
        Ok(result)
    }

    /// Whether the key currently has an unexpired holder.
    pub async fn is_held(&self, key: &str) -> bool {
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            match redis.cache_get(key).await {
                Ok(value) => return value.is_some(),
                Err(e) => warn!(key, error = %e, "Redis lock lookup failed"),
            }
        }
        self.locks
            .get(key)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let locks = LockManager::new();
        let token = locks
            .acquire("execution:a", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(locks
            .acquire("execution:a", Duration::from_secs(10))
            .await
            .is_none());
        assert!(locks.release("execution:a", token).await);
        assert!(locks
            .acquire("execution:a", Duration::from_secs(10))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let locks = LockManager::new();
        let _held = locks.acquire("k", Duration::from_secs(10)).await.unwrap();
        let stranger = locks.acquire("other", Duration::from_secs(10)).await.unwrap();
        assert!(!locks.release("k", stranger).await);
        assert!(locks.is_held("k").await);
    }

    #[tokio::test]
    async fn expired_lock_is_claimable() {
        let locks = LockManager::new();
        let old = locks.acquire("k", Duration::from_millis(0)).await.unwrap();
        let new = locks.acquire("k", Duration::from_secs(10)).await.unwrap();
        assert_ne!(old, new);
        // The stale holder's release must not disturb the new owner.
        assert!(!locks.release("k", old).await);
        assert!(locks.is_held("k").await);
    }

    #[tokio::test]
    async fn with_lock_releases_on_exit() {
        let locks = LockManager::new();
        let value = locks
            .with_lock("k", Duration::from_secs(5), || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(!locks.is_held("k").await);

        let _held = locks.acquire("k", Duration::from_secs(5)).await.unwrap();
        let err = locks
            .with_lock("k", Duration::from_secs(5), || async { 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::AcquisitionFailed(_)));
    }
}
