//! Redis-backed lock store (feature `redis`).
//!
//! The lock value is a small JSON document `{holder, acquired_at_ms,
//! expires_at_ms, version}` stored with a `PX` expiry, so Redis itself evicts
//! abandoned locks. Compare-and-set steps run as Lua scripts to stay atomic.
//! The fencing version lives in a separate, non-expiring counter key.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::instrument;

use super::{HolderId, LockError, LockKey, LockRecord, LockStore};

const DEFAULT_KEY_PREFIX: &str = "tenantflow:lock";

const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local rec = cjson.decode(current)
  if rec.holder ~= ARGV[1] then
    return 0
  end
end
local version = redis.call('INCR', KEYS[2])
local value = cjson.encode({
  holder = ARGV[1],
  acquired_at_ms = tonumber(ARGV[2]),
  expires_at_ms = tonumber(ARGV[3]),
  version = version
})
redis.call('SET', KEYS[1], value, 'PX', ARGV[4])
return version
"#;

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
if cjson.decode(current).holder ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

const EXTEND_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local rec = cjson.decode(current)
if rec.holder ~= ARGV[1] then
  return 0
end
rec.expires_at_ms = tonumber(ARGV[2])
redis.call('SET', KEYS[1], cjson.encode(rec), 'PX', ARGV[3])
return 1
"#;

const TAKE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  redis.call('DEL', KEYS[1])
end
return current
"#;

#[derive(Debug, Serialize, Deserialize)]
struct LockValue {
    holder: String,
    acquired_at_ms: i64,
    expires_at_ms: i64,
    version: u64,
}

#[derive(Clone)]
pub struct RedisLockStore {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<MultiplexedConnection>>,
    key_prefix: String,
}

impl RedisLockStore {
    /// `redis_url` e.g. `redis://localhost:6379`.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Unavailable(e.to_string()))?;
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

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        let client = self.client.clone();
        self.conn
            .get_or_try_init(|| async move { client.get_multiplexed_async_connection().await })
            .await
            .cloned()
            .map_err(map_redis_error)
    }

    fn lock_key(&self, key: &LockKey) -> String {
        format!("{}:{}:{}", self.key_prefix, key.tenant_id, key.resource)
    }

    fn version_key(&self, key: &LockKey) -> String {
        format!("{}:version", self.lock_key(key))
    }

    fn decode(key: &LockKey, raw: &str) -> Result<LockRecord, LockError> {
        let value: LockValue = serde_json::from_str(raw)
            .map_err(|e| LockError::Storage(format!("corrupt lock value for {key}: {e}")))?;
        Ok(LockRecord {
            key: key.clone(),
            holder: HolderId::from_string(value.holder),
            acquired_at: from_millis(value.acquired_at_ms),
            expires_at: from_millis(value.expires_at_ms),
            version: value.version,
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn ttl_millis(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (expires_at - now).num_milliseconds().max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    #[instrument(skip(self, holder), fields(key = %key), err)]
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockError> {
        let mut conn = self.connection().await?;
        let version: i64 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.lock_key(key))
            .key(self.version_key(key))
            .arg(holder.as_str())
            .arg(now.timestamp_millis())
            .arg(expires_at.timestamp_millis())
            .arg(ttl_millis(expires_at, now))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if version <= 0 {
            return Ok(None);
        }
        Ok(Some(LockRecord {
            key: key.clone(),
            holder: holder.clone(),
            acquired_at: now,
            expires_at,
            version: version as u64,
        }))
    }

    #[instrument(skip(self, holder), fields(key = %key), err)]
    async fn release(&self, key: &LockKey, holder: &HolderId) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(key))
            .arg(holder.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(released == 1)
    }

    #[instrument(skip(self, holder), fields(key = %key), err)]
    async fn extend(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(self.lock_key(key))
            .arg(holder.as_str())
            .arg(expires_at.timestamp_millis())
            .arg(ttl_millis(expires_at, now))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(extended == 1)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn force_release(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        let mut conn = self.connection().await?;
        let evicted: Option<String> = redis::Script::new(TAKE_SCRIPT)
            .key(self.lock_key(key))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        evicted.map(|raw| Self::decode(key, &raw)).transpose()
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.lock_key(key)).await.map_err(map_redis_error)?;
        raw.map(|raw| Self::decode(key, &raw)).transpose()
    }

    /// Redis evicts expired locks on its own; there is never anything to reap.
    async fn list_expired(
        &self,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<LockRecord>, LockError> {
        Ok(Vec::new())
    }

    async fn reap_expired(&self, _key: &LockKey, _now: DateTime<Utc>) -> Result<bool, LockError> {
        Ok(false)
    }
}

pub(crate) fn map_redis_error(err: redis::RedisError) -> LockError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        LockError::Unavailable(err.to_string())
    } else {
        LockError::Storage(err.to_string())
    }
}
