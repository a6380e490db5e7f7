//! Redis-backed limiter store shared by every worker process

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::fmt;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::rate_limit::LimiterError;
use crate::store::{millis_ceil, Consumption, LimiterStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// KEYS[1] window key; ARGV cost, points, window ms.
// Returns {allowed, consumed, pttl}.
const CONSUME_SCRIPT: &str = r#"
local cost = tonumber(ARGV[1])
local points = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local ttl = redis.call('PTTL', KEYS[1])
local consumed = 0
if ttl > 0 then
  consumed = tonumber(redis.call('GET', KEYS[1]) or '0')
else
  ttl = window
end
if consumed + cost > points then
  return {0, consumed, ttl}
end
if consumed == 0 then
  redis.call('SET', KEYS[1], cost, 'PX', window)
else
  redis.call('INCRBY', KEYS[1], cost)
end
return {1, consumed + cost, ttl}
"#;

/// Fixed windows kept in Redis so all processes draw from one budget
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    script: redis::Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    ///
    /// Any failure is `StoreUnavailable`; callers must not fall back to a
    /// local store.
    #[instrument(skip(redis_url))]
    pub async fn connect(redis_url: &str) -> Result<Self, LimiterError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LimiterError::StoreUnavailable(e.to_string()))?;

        let mut conn = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| LimiterError::StoreUnavailable("connection timed out".into()))?
        .map_err(|e| LimiterError::StoreUnavailable(e.to_string()))?;

        let pong: String = tokio::time::timeout(
            CONNECT_TIMEOUT,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| LimiterError::StoreUnavailable("PING timed out".into()))?
        .map_err(|e| LimiterError::StoreUnavailable(e.to_string()))?;

        if pong != "PONG" {
            warn!(reply = %pong, "Unexpected PING reply from Redis");
        }

        Ok(Self {
            conn,
            script: redis::Script::new(CONSUME_SCRIPT),
        })
    }
}

#[async_trait]
impl LimiterStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn consume(
        &self,
        key: &str,
        cost: u32,
        points: u32,
        window: Duration,
    ) -> Result<Consumption, LimiterError> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(cost)
            .arg(points)
            .arg(millis_ceil(window).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(e.to_string()))?;

        match reply.as_slice() {
            [allowed, consumed, ttl] => Ok(Consumption {
                allowed: *allowed == 1,
                consumed: u32::try_from(*consumed).unwrap_or(u32::MAX),
                ms_before_next: u64::try_from(*ttl).unwrap_or(0),
            }),
            other => Err(LimiterError::Store(format!(
                "unexpected script reply: {:?}",
                other
            ))),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{RateLimiterConfig, RateLimiterFactory};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unreachable_store_fails_loudly() {
        let result = RateLimiterFactory::shared("redis://127.0.0.1:1").await;
        assert!(matches!(result, Err(LimiterError::StoreUnavailable(_))));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_concurrent_consumers_share_one_budget() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let factory = Arc::new(RateLimiterFactory::shared(&url).await.unwrap());
        let prefix = format!("jikanAPI-test-{}", std::process::id());
        let limiter = factory
            .create_rate_limiter(RateLimiterConfig::new(prefix, 3, 1))
            .unwrap();
        limiter.reset("global").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.consume("global", 1).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let fourth = limiter.consume("global", 1).await.unwrap_err();
        assert!(fourth.retry_after().unwrap() <= Duration::from_secs(1));
    }
}
