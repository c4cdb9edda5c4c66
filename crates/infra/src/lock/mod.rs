//! Per-tenant distributed locks.
//!
//! A lock is identified by `(tenant_id, resource_kind)` and is live while
//! `now < expires_at`. Acquisition is a single compare-and-set in the store;
//! release and extend are conditional on the holder token, so a process whose
//! lock expired can never free (or prolong) a lock someone else now holds.
//!
//! Every successful acquisition bumps a per-key `version`, usable as a fencing
//! token by callers that write to external systems.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantflow_core::{DomainError, TenantId};

use crate::retry::RetryPolicy;

pub mod manager;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use manager::{LockGuard, LockManager};
pub use postgres::PostgresLockStore;
#[cfg(feature = "redis")]
pub use redis::RedisLockStore;
pub use store::{InMemoryLockStore, LockStore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock store unavailable: {0}")]
    Unavailable(String),
    #[error("lock storage error: {0}")]
    Storage(String),
}

/// What a lock protects within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Provisioning,
    Conversation,
    Operator,
    Custom(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Provisioning => "provisioning",
            ResourceKind::Conversation => "conversation",
            ResourceKind::Operator => "operator",
            ResourceKind::Custom(name) => name,
        }
    }
}

impl core::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(DomainError::validation("resource kind cannot be empty")),
            "provisioning" => Ok(ResourceKind::Provisioning),
            "conversation" => Ok(ResourceKind::Conversation),
            "operator" => Ok(ResourceKind::Operator),
            other => Ok(ResourceKind::Custom(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub tenant_id: TenantId,
    pub resource: ResourceKind,
}

impl LockKey {
    pub fn new(tenant_id: TenantId, resource: ResourceKind) -> Self {
        Self {
            tenant_id,
            resource,
        }
    }
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.resource)
    }
}

/// Opaque token identifying one acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for HolderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: LockKey,
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl LockRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.expires_at - self.acquired_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    pub default_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-call acquisition options.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    pub ttl: Duration,
    pub retry: RetryPolicy,
}

impl LockOptions {
    /// Single attempt, no waiting.
    pub fn try_once(ttl: Duration) -> Self {
        Self {
            ttl,
            retry: RetryPolicy::no_retry(),
        }
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: config.default_ttl,
            retry: config.retry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_parses_builtins_and_custom_names() {
        assert_eq!(
            "provisioning".parse::<ResourceKind>().unwrap(),
            ResourceKind::Provisioning
        );
        assert_eq!(
            "billing-sync".parse::<ResourceKind>().unwrap(),
            ResourceKind::Custom("billing-sync".into())
        );
        assert!(" ".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn record_is_live_strictly_before_expiry() {
        let acquired_at = Utc::now();
        let record = LockRecord {
            key: LockKey::new(TenantId::new(), ResourceKind::Operator),
            holder: HolderId::new(),
            acquired_at,
            expires_at: acquired_at + chrono::Duration::seconds(30),
            version: 1,
        };

        assert!(record.is_live(acquired_at + chrono::Duration::seconds(29)));
        assert!(!record.is_live(acquired_at + chrono::Duration::seconds(30)));
        assert_eq!(record.ttl(), chrono::Duration::seconds(30));
    }
}
