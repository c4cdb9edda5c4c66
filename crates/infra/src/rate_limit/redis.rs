//! Redis sliding-window counters (feature `redis`).
//!
//! Each counter key is a sorted set scored by event time in milliseconds.
//! A Lua script prunes, counts and conditionally adds in one round trip, so
//! every replica sees the same window.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;
use tracing::instrument;
use uuid::Uuid;

use super::store::{CounterKey, CounterStore};
use super::window::WindowState;
use super::RateLimitError;

const DEFAULT_KEY_PREFIX: &str = "tenantflow:rate";

/// KEYS[1] window set. ARGV: now_ms, window_ms, cap, member, consume (0/1).
/// Returns {allowed, count, oldest_ms}.
const WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local cap = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < cap then
  allowed = 1
  if ARGV[5] == '1' then
    redis.call('ZADD', KEYS[1], now, ARGV[4])
    redis.call('PEXPIRE', KEYS[1], window)
    count = count + 1
  end
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_ms = now
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<MultiplexedConnection>>,
    key_prefix: String,
}

impl RedisCounterStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(OnceCell::new()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RateLimitError> {
        let client = self.client.clone();
        self.conn
            .get_or_try_init(|| async move { client.get_multiplexed_async_connection().await })
            .await
            .cloned()
            .map_err(map_redis_error)
    }

    fn redis_key(&self, key: &CounterKey) -> String {
        format!("{}:{}:{}", self.key_prefix, key.tenant_id, key.class)
    }

    async fn eval(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
        consume: bool,
    ) -> Result<WindowState, RateLimitError> {
        let mut conn = self.connection().await?;
        let window_ms = window.num_milliseconds().max(1);
        let (allowed, count, oldest_ms): (i64, i64, i64) = redis::Script::new(WINDOW_SCRIPT)
            .key(self.redis_key(key))
            .arg(now.timestamp_millis())
            .arg(window_ms)
            .arg(cap)
            .arg(Uuid::now_v7().to_string())
            .arg(if consume { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let oldest = Utc
            .timestamp_millis_opt(oldest_ms)
            .single()
            .unwrap_or(now);
        Ok(WindowState {
            allowed: allowed == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            reset_at: oldest + window,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn try_consume(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        self.eval(key, window, cap, now, true).await
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        self.eval(key, window, cap, now, false).await
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }
}

fn map_redis_error(err: redis::RedisError) -> RateLimitError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        RateLimitError::Unavailable(err.to_string())
    } else {
        RateLimitError::Storage(err.to_string())
    }
}
