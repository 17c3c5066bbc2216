use crate::CoordinationError;
use moka::future::Cache;
use moka::Expiry;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

#[cfg(feature = "redis-backend")]
use crate::redis_backend::RedisCoordination;
#[cfg(feature = "redis-backend")]
use std::sync::Arc;

/// Cached value with the TTL it was stored under.
#[derive(Clone)]
struct CachedEntry {
    value: Vec<u8>,
    ttl: Option<Duration>,
}

/// Per-entry expiration policy: each entry carries its own TTL.
struct PerEntryTtl;

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }
}

/// TTL key/value cache over opaque byte strings.
///
/// Serialization is the caller's concern. The local tier is a Moka cache;
/// with the `redis-backend` feature and a configured backend, reads try
/// Redis first and writes land in both tiers, degrading to the local tier
/// when Redis is unreachable. Prefix invalidation takes effect before
/// returning, so subsequent gets of affected keys miss.
pub struct CacheService {
    local: Cache<String, CachedEntry>,
    #[cfg(feature = "redis-backend")]
    redis: Option<Arc<RedisCoordination>>,
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService {
    pub fn new() -> Self {
        Self::with_max_capacity(100_000)
    }

    pub fn with_max_capacity(max_entries: u64) -> Self {
        let local = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .support_invalidation_closures()
            .build();
        Self {
            local,
            #[cfg(feature = "redis-backend")]
            redis: None,
        }
    }

    #[cfg(feature = "redis-backend")]
    pub fn with_redis(redis: Arc<RedisCoordination>) -> Self {
        let mut service = Self::new();
        service.redis = Some(redis);
        service
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            match redis.cache_get(key).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "Redis cache get failed; using local tier"),
            }
        }
        self.local.get(key).await.map(|entry| entry.value)
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.cache_set(key, value.clone(), ttl).await {
                warn!(key, error = %e, "Redis cache set failed; value kept locally");
            }
        }
        self.local
            .insert(key.to_string(), CachedEntry { value, ttl })
            .await;
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut deleted = self.local.remove(key).await.is_some();
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            match redis.cache_delete(key).await {
                Ok(redis_deleted) => deleted = deleted || redis_deleted,
                Err(e) => warn!(key, error = %e, "Redis cache delete failed"),
            }
        }
        deleted
    }

    /// Remove every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        let owned = prefix.to_string();
        if let Err(e) = self
            .local
            .invalidate_entries_if(move |key, _| key.starts_with(&owned))
        {
            warn!(prefix, error = %e, "Prefix invalidation predicate rejected");
        }
        #[cfg(feature = "redis-backend")]
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.cache_invalidate_prefix(prefix).await {
                warn!(prefix, error = %e, "Redis prefix invalidation failed");
            }
        }
    }

    /// Read-through: return the cached value or run `producer`, store its
    /// result under `ttl`, and return it.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Vec<u8>, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, CoordinationError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = producer().await?;
        self.set(key, value.clone(), ttl).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let cache = CacheService::new();
        cache.set("a", b"one".to_vec(), None).await;
        assert_eq!(cache.get("a").await.unwrap(), b"one");
        assert!(cache.delete("a").await);
        assert!(cache.get("a").await.is_none());
        assert!(!cache.delete("a").await);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = CacheService::new();
        cache
            .set("a", b"one".to_vec(), Some(Duration::from_millis(20)))
            .await;
        assert_eq!(cache.get("a").await.unwrap(), b"one");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn entries_without_ttl_persist() {
        let cache = CacheService::new();
        cache.set("keep", b"v".to_vec(), None).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("keep").await.unwrap(), b"v");
    }

    #[tokio::test]
    async fn prefix_invalidation_is_visible_to_following_gets() {
        let cache = CacheService::new();
        cache.set("wf:1:status", b"active".to_vec(), None).await;
        cache.set("wf:1:stats", b"{}".to_vec(), None).await;
        cache.set("wf:2:status", b"draft".to_vec(), None).await;

        cache.invalidate_prefix("wf:1:").await;
        assert!(cache.get("wf:1:status").await.is_none());
        assert!(cache.get("wf:1:stats").await.is_none());
        assert_eq!(cache.get("wf:2:status").await.unwrap(), b"draft");
    }

    #[tokio::test]
    async fn get_or_compute_runs_producer_once() {
        let cache = CacheService::new();
        let first = cache
            .get_or_compute("k", None, || async { Ok(b"computed".to_vec()) })
            .await
            .unwrap();
        assert_eq!(first, b"computed");

        // Second call must hit the cache, not the producer.
        let second = cache
            .get_or_compute("k", None, || async {
                Err(CoordinationError::Producer("must not run".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second, b"computed");
    }
}
