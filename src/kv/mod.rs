//! Shared key-value store adapter.
//!
//! Backs the rate limiter (C2), result cache (C3), job queue/records (C8),
//! and provider health/stats (C5) with one Redis deployment. Sorted sets
//! give the sliding-window rate limiter its window; the Lua scripts make
//! the window-count, window-record, and burst-allowance-consume operations
//! atomic across concurrent callers. Counting a window is read-only and
//! safe to call speculatively; only `window_record` writes an entry, so a
//! caller that is ultimately denied never pollutes its own window.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::{AsyncCommands, Script};

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("kv operation timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("script execution error: {0}")]
    Script(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Outcome of the read-only sliding-window count script.
#[derive(Debug, Clone, Copy)]
pub struct WindowUsage {
    pub count: u64,
    pub oldest_entry_secs_ago: Option<u64>,
}

/// Outcome of the atomic burst-allowance compare-and-swap script.
pub struct BurstConsumption {
    pub granted: bool,
    pub remaining: u64,
}

/// One write in a [`KvStore::pipeline`] batch.
pub enum PipelineOp {
    /// `SET key value [EX ttl]`.
    Set { key: String, value: String, ttl: Option<Duration> },
    /// `SADD key member` followed by `EXPIRE key ttl` when `ttl` is set.
    SaddWithTtl { key: String, member: String, ttl: Option<Duration> },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;
    async fn delete(&self, key: &str) -> KvResult<bool>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    async fn incr(&self, key: &str, by: i64) -> KvResult<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> KvResult<()>;
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;
    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Trim anything older than `window_secs` and return the resulting
    /// count, without recording a new entry. Safe to call on a request that
    /// may ultimately be denied.
    async fn window_count(
        &self,
        key: &str,
        now_millis: i64,
        window_secs: u64,
    ) -> KvResult<WindowUsage>;

    /// Record one event at `now_millis` in the sliding window and refresh
    /// its TTL. Call only once a request has actually been admitted.
    async fn window_record(
        &self,
        key: &str,
        now_millis: i64,
        window_secs: u64,
    ) -> KvResult<()>;

    /// Attempt to consume `cost` burst tokens from a bucket capped at
    /// `capacity`, refilled continuously over `refill_window_secs`.
    async fn burst_consume(
        &self,
        key: &str,
        capacity: u64,
        refill_window_secs: u64,
        cost: u64,
        now_millis: i64,
    ) -> KvResult<BurstConsumption>;

    /// Execute a batch of writes atomically (best-effort: implementations
    /// backed by a real pipeline send them in one round trip).
    async fn pipeline(&self, ops: Vec<PipelineOp>) -> KvResult<()>;
}

pub struct RedisKvStore {
    pool: Pool,
    count_script: Script,
    record_script: Script,
    burst_script: Script,
}

impl RedisKvStore {
    pub fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let cfg = PoolConfig::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self {
            pool,
            count_script: Script::new(COUNT_SCRIPT),
            record_script: Script::new(RECORD_SCRIPT),
            burst_script: Script::new(BURST_SCRIPT),
        })
    }

    pub fn into_shared(self) -> Arc<dyn KvStore> {
        Arc::new(self)
    }

    async fn conn(&self) -> KvResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }
}

/// Trims entries older than the window and returns the current count plus
/// the age of the oldest surviving entry. Never writes a new entry.
/// KEYS[1] = sorted-set key. ARGV[1] = now (ms). ARGV[2] = window (secs).
const COUNT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2]) * 1000
local cutoff = now - window_ms

redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)

local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_age = -1
if oldest[2] ~= nil then
    oldest_age = math.floor((now - tonumber(oldest[2])) / 1000)
end
return {count, oldest_age}
"#;

/// Records one event in the sliding window and refreshes the key's TTL to
/// twice the window so a reader trimming at the window edge never races a
/// key expiring underneath it.
/// KEYS[1] = sorted-set key. ARGV[1] = now (ms). ARGV[2] = window (secs).
const RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2]) * 1000

redis.call('ZADD', key, now, now .. '-' .. tostring(math.random(1, 1000000000)))
redis.call('PEXPIRE', key, window_ms * 2)
return 1
"#;

/// Continuous-refill token bucket, compare-and-swap in one round trip.
/// KEYS[1] = bucket key. ARGV[1] = capacity. ARGV[2] = refill window (secs).
/// ARGV[3] = cost. ARGV[4] = now (ms).
const BURST_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_window_ms = tonumber(ARGV[2]) * 1000
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local data = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(data[1])
local ts = tonumber(data[2])

if tokens == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
local refill_rate = capacity / refill_window_ms
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local granted = 0
if tokens >= cost then
    tokens = tokens - cost
    granted = 1
end

redis.call('HSET', key, 'tokens', tokens, 'ts', now)
redis.call('PEXPIRE', key, refill_window_ms * 2)

return {granted, math.floor(tokens)}
"#;

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(t) => conn
                .set_ex(key, value, t.as_secs())
                .await
                .map_err(|e| KvError::Unavailable(e.to_string())),
            None => conn
                .set(key, value)
                .await
                .map_err(|e| KvError::Unavailable(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        conn.exists(key)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn incr(&self, key: &str, by: i64) -> KvResult<i64> {
        let mut conn = self.conn().await?;
        conn.incr(key, by)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.conn().await?;
        conn.expire(key, ttl.as_secs() as i64)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn sadd(&self, key: &str, member: &str) -> KvResult<()> {
        let mut conn = self.conn().await?;
        conn.sadd(key, member)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.smembers(key)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn().await?;
        conn.sismember(key, member)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn window_count(
        &self,
        key: &str,
        now_millis: i64,
        window_secs: u64,
    ) -> KvResult<WindowUsage> {
        let mut conn = self.conn().await?;
        let (count, oldest_age): (u64, i64) = self
            .count_script
            .key(key)
            .arg(now_millis)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| KvError::Script(e.to_string()))?;

        Ok(WindowUsage {
            count,
            oldest_entry_secs_ago: if oldest_age >= 0 {
                Some(oldest_age as u64)
            } else {
                None
            },
        })
    }

    async fn window_record(&self, key: &str, now_millis: i64, window_secs: u64) -> KvResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .record_script
            .key(key)
            .arg(now_millis)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| KvError::Script(e.to_string()))?;
        Ok(())
    }

    async fn burst_consume(
        &self,
        key: &str,
        capacity: u64,
        refill_window_secs: u64,
        cost: u64,
        now_millis: i64,
    ) -> KvResult<BurstConsumption> {
        let mut conn = self.conn().await?;
        let (granted, remaining): (i64, u64) = self
            .burst_script
            .key(key)
            .arg(capacity)
            .arg(refill_window_secs)
            .arg(cost)
            .arg(now_millis)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| KvError::Script(e.to_string()))?;

        Ok(BurstConsumption {
            granted: granted == 1,
            remaining,
        })
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> KvResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                PipelineOp::Set { key, value, ttl } => match ttl {
                    Some(t) => {
                        pipe.set_ex(key, value, t.as_secs());
                    }
                    None => {
                        pipe.set(key, value);
                    }
                },
                PipelineOp::SaddWithTtl { key, member, ttl } => {
                    pipe.sadd(key, member);
                    if let Some(t) = ttl {
                        pipe.expire(key, t.as_secs() as i64);
                    }
                }
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_script_never_writes_an_entry() {
        assert!(COUNT_SCRIPT.contains("ZREMRANGEBYSCORE"));
        assert!(COUNT_SCRIPT.contains("ZCARD"));
        assert!(!COUNT_SCRIPT.contains("ZADD"));
    }

    #[test]
    fn record_script_adds_an_entry() {
        assert!(RECORD_SCRIPT.contains("ZADD"));
        assert!(RECORD_SCRIPT.contains("PEXPIRE"));
    }

    #[test]
    fn burst_script_is_non_empty_lua() {
        assert!(BURST_SCRIPT.contains("HMGET"));
        assert!(BURST_SCRIPT.contains("HSET"));
    }
}
