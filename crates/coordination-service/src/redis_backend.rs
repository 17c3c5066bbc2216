//! Redis backing for the coordination primitives.
//!
//! Multi-node deployments share lock, cache and counter state through
//! Redis; single-node deployments keep the in-process defaults.

use crate::rate_limit::RateLimitDecision;
use crate::CoordinationError;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{info, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisCoordination {
    connection: ConnectionManager,
}

impl RedisCoordination {
    pub async fn connect(url: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(url)
            .map_err(|e| CoordinationError::Backend(format!("open redis client: {}", e)))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CoordinationError::Backend(format!("connect to redis: {}", e)))?;
        info!("Redis coordination backend connected");
        Ok(Self { connection })
    }

    /// SET NX PX acquisition; the stored value is the caller's fencing
    /// token.
    pub async fn acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, CoordinationError> {
        let mut conn = self.connection.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("lock acquire: {}", e)))?;
        Ok(acquired.is_some())
    }

    /// Scripted compare-and-delete so only the token holder can release.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordinationError::Backend(format!("lock release: {}", e)))?;
        Ok(deleted == 1)
    }

    pub async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut conn = self.connection.clone();
        conn.get(key)
            .await
            .map_err(|e| CoordinationError::Backend(format!("cache get: {}", e)))
    }

    pub async fn cache_set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| CoordinationError::Backend(format!("cache set_ex: {}", e))),
            None => conn
                .set(key, value)
                .await
                .map_err(|e| CoordinationError::Backend(format!("cache set: {}", e))),
        }
    }

    pub async fn cache_delete(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = conn
            .del(key)
            .await
            .map_err(|e| CoordinationError::Backend(format!("cache del: {}", e)))?;
        Ok(deleted > 0)
    }

    /// SCAN-collect then DEL; linear in matching keys.
    pub async fn cache_invalidate_prefix(&self, prefix: &str) -> Result<usize, CoordinationError> {
        let pattern = format!("{}*", prefix);
        let mut scan_conn = self.connection.clone();
        let keys: Vec<String> = {
            let mut iter = scan_conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(|e| CoordinationError::Backend(format!("cache scan: {}", e)))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let deleted: i64 = conn
            .del(&keys)
            .await
            .map_err(|e| CoordinationError::Backend(format!("cache prefix del: {}", e)))?;
        Ok(deleted as usize)
    }

    /// Fixed-window counter: INCR + PEXPIRE on first hit, PTTL for the
    /// remaining window. Errors are surfaced so the caller can fail open.
    pub async fn count_request(
        &self,
        bucket_prefix: &str,
        client_id: &str,
        window_ms: u64,
        max: u64,
    ) -> Result<RateLimitDecision, CoordinationError> {
        let key = format!("ratelimit:{}:{}", bucket_prefix, client_id);
        let mut conn = self.connection.clone();

        let count: u64 = conn
            .incr(&key, 1u64)
            .await
            .map_err(|e| CoordinationError::Backend(format!("counter incr: {}", e)))?;
        if count == 1 {
            let _: bool = conn
                .pexpire(&key, window_ms as i64)
                .await
                .map_err(|e| CoordinationError::Backend(format!("counter pexpire: {}", e)))?;
        }
        let ttl_ms: i64 = conn
            .pttl(&key)
            .await
            .map_err(|e| CoordinationError::Backend(format!("counter pttl: {}", e)))?;
        let retry_after_ms = ttl_ms.max(0);

        Ok(RateLimitDecision {
            allowed: count <= max,
            limit: max,
            remaining: max.saturating_sub(count),
            reset_at_ms: Utc::now().timestamp_millis() + retry_after_ms,
            retry_after_ms,
            count,
        })
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.connection.clone();
        match redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Redis ping failed: {}", e);
                false
            }
        }
    }
}
