use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{HolderId, LockError, LockKey, LockRecord};

/// Backing store for tenant locks.
///
/// Every mutating operation is a single atomic conditional step.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if it is free, expired, or already held by `holder`.
    /// Returns the new record, or `None` when another live holder owns it.
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockError>;

    /// Release only if `holder` still owns the lock.
    async fn release(&self, key: &LockKey, holder: &HolderId) -> Result<bool, LockError>;

    /// Move the expiry of a live lock owned by `holder`.
    async fn extend(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError>;

    /// Unconditional removal. Returns the evicted record.
    async fn force_release(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError>;

    /// Current record, live or not.
    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError>;

    /// Held records whose expiry has passed (abandoned by a crashed holder).
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LockRecord>, LockError>;

    /// Remove the record if it is still expired at `now`.
    async fn reap_expired(&self, key: &LockKey, now: DateTime<Utc>) -> Result<bool, LockError>;
}

#[async_trait]
impl<S> LockStore for Arc<S>
where
    S: LockStore + ?Sized,
{
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockError> {
        (**self).try_acquire(key, holder, expires_at, now).await
    }

    async fn release(&self, key: &LockKey, holder: &HolderId) -> Result<bool, LockError> {
        (**self).release(key, holder).await
    }

    async fn extend(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        (**self).extend(key, holder, expires_at, now).await
    }

    async fn force_release(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        (**self).force_release(key).await
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        (**self).get(key).await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LockRecord>, LockError> {
        (**self).list_expired(now, limit).await
    }

    async fn reap_expired(&self, key: &LockKey, now: DateTime<Utc>) -> Result<bool, LockError> {
        (**self).reap_expired(key, now).await
    }
}

#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<LockKey, LockRecord>,
    /// Survives release so fencing versions stay monotonic per key.
    versions: HashMap<LockKey, u64>,
}

/// Process-local lock store (tests, single-instance deployments).
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    table: Mutex<LockTable>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LockTable>, LockError> {
        self.table
            .lock()
            .map_err(|_| LockError::Unavailable("lock table poisoned".into()))
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockError> {
        let mut table = self.lock()?;
        if let Some(current) = table.held.get(key) {
            if current.is_live(now) && &current.holder != holder {
                return Ok(None);
            }
        }

        let version = table.versions.entry(key.clone()).or_default();
        *version += 1;
        let record = LockRecord {
            key: key.clone(),
            holder: holder.clone(),
            acquired_at: now,
            expires_at,
            version: *version,
        };
        table.held.insert(key.clone(), record.clone());
        Ok(Some(record))
    }

    async fn release(&self, key: &LockKey, holder: &HolderId) -> Result<bool, LockError> {
        let mut table = self.lock()?;
        match table.held.get(key) {
            Some(current) if &current.holder == holder => {
                table.held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let mut table = self.lock()?;
        match table.held.get_mut(key) {
            Some(current) if &current.holder == holder && current.is_live(now) => {
                current.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        Ok(self.lock()?.held.remove(key))
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        Ok(self.lock()?.held.get(key).cloned())
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LockRecord>, LockError> {
        let table = self.lock()?;
        let mut expired: Vec<LockRecord> = table
            .held
            .values()
            .filter(|r| !r.is_live(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn reap_expired(&self, key: &LockKey, now: DateTime<Utc>) -> Result<bool, LockError> {
        let mut table = self.lock()?;
        match table.held.get(key) {
            Some(current) if !current.is_live(now) => {
                table.held.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tenantflow_core::TenantId;

    use super::*;
    use crate::lock::ResourceKind;

    fn key() -> LockKey {
        LockKey::new(TenantId::new(), ResourceKind::Provisioning)
    }

    #[tokio::test]
    async fn second_holder_is_refused_until_expiry() {
        let store = InMemoryLockStore::new();
        let key = key();
        let now = Utc::now();
        let a = HolderId::new();
        let b = HolderId::new();

        let first = store
            .try_acquire(&key, &a, now + Duration::seconds(10), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.version, 1);

        assert!(store
            .try_acquire(&key, &b, now + Duration::seconds(10), now + Duration::seconds(9))
            .await
            .unwrap()
            .is_none());

        // Exactly at acquired_at + ttl the lock is no longer live.
        let second = store
            .try_acquire(&key, &b, now + Duration::seconds(20), now + Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.holder, b);
        assert_eq!(second.version, 2);
    }

    #[tokio::test]
    async fn release_and_extend_require_the_holder() {
        let store = InMemoryLockStore::new();
        let key = key();
        let now = Utc::now();
        let owner = HolderId::new();
        let stranger = HolderId::new();

        store
            .try_acquire(&key, &owner, now + Duration::seconds(10), now)
            .await
            .unwrap();

        assert!(!store.release(&key, &stranger).await.unwrap());
        assert!(!store
            .extend(&key, &stranger, now + Duration::seconds(60), now)
            .await
            .unwrap());
        assert!(store
            .extend(&key, &owner, now + Duration::seconds(60), now)
            .await
            .unwrap());
        assert_eq!(
            store.get(&key).await.unwrap().unwrap().expires_at,
            now + Duration::seconds(60)
        );
        assert!(store.release(&key, &owner).await.unwrap());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn versions_stay_monotonic_across_release() {
        let store = InMemoryLockStore::new();
        let key = key();
        let now = Utc::now();
        let holder = HolderId::new();

        for expected in 1..=3 {
            let record = store
                .try_acquire(&key, &holder, now + Duration::seconds(5), now)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.version, expected);
            store.release(&key, &holder).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reap_only_touches_expired_records() {
        let store = InMemoryLockStore::new();
        let live = key();
        let stale = key();
        let now = Utc::now();

        store
            .try_acquire(&live, &HolderId::new(), now + Duration::minutes(5), now)
            .await
            .unwrap();
        store
            .try_acquire(&stale, &HolderId::new(), now + Duration::seconds(1), now)
            .await
            .unwrap();

        let later = now + Duration::seconds(2);
        let expired = store.list_expired(later, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].key, stale);

        assert!(!store.reap_expired(&live, later).await.unwrap());
        assert!(store.reap_expired(&stale, later).await.unwrap());
        assert!(store.list_expired(later, 10).await.unwrap().is_empty());
    }
}
