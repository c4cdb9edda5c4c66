use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use tenantflow_core::{Clock, TenantId};

use super::{HolderId, LockConfig, LockError, LockKey, LockOptions, LockRecord, LockStore, ResourceKind};
use crate::time::chrono_duration;

/// Guards handed out by one manager that have not been released yet.
#[derive(Debug, Default)]
struct HeldLocks {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, (LockKey, HolderId)>>,
}

impl HeldLocks {
    fn register(&self, key: LockKey, holder: HolderId) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (key, holder));
        id
    }

    /// Returns `true` if the entry was still registered.
    fn remove(&self, id: u64) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    fn drain(&self) -> Vec<(LockKey, HolderId)> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, entry)| entry)
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Acquires and tracks tenant locks.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
    held: Arc<HeldLocks>,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            config,
            held: Arc::new(HeldLocks::default()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn default_options(&self) -> LockOptions {
        LockOptions::from(&self.config)
    }

    /// Try to take `(tenant_id, resource)`, retrying with backoff.
    ///
    /// `Ok(None)` means the lock stayed busy for every attempt. Store failures
    /// are returned as errors and never reported as acquired.
    #[instrument(skip(self, options), fields(tenant_id = %tenant_id, resource = %resource), err)]
    pub async fn acquire(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
        options: LockOptions,
    ) -> Result<Option<LockGuard>, LockError> {
        let key = LockKey::new(tenant_id, resource);
        let holder = HolderId::new();
        let mut attempt = 0u32;

        loop {
            let now = self.clock.now();
            let expires_at = now + chrono_duration(options.ttl);
            if let Some(record) = self.store.try_acquire(&key, &holder, expires_at, now).await? {
                debug!(%key, version = record.version, attempt, "lock acquired");
                return Ok(Some(self.guard(record)));
            }

            if !options.retry.should_retry(attempt) {
                debug!(%key, attempts = attempt + 1, "lock busy");
                return Ok(None);
            }
            attempt += 1;
            tokio::time::sleep(options.retry.delay_for_attempt(attempt)).await;
        }
    }

    /// Single attempt with the configured TTL.
    pub async fn try_acquire(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> Result<Option<LockGuard>, LockError> {
        self.acquire(tenant_id, resource, LockOptions::try_once(self.config.default_ttl))
            .await
    }

    /// Evict whoever holds the lock. Operator remediation only.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, resource = %resource), err)]
    pub async fn force_release(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> Result<Option<LockRecord>, LockError> {
        let key = LockKey::new(tenant_id, resource);
        let evicted = self.store.force_release(&key).await?;
        if let Some(record) = &evicted {
            warn!(%key, holder = %record.holder, version = record.version, "lock force-released");
        }
        Ok(evicted)
    }

    /// The live holder of a lock, if any.
    pub async fn inspect(
        &self,
        tenant_id: TenantId,
        resource: ResourceKind,
    ) -> Result<Option<LockRecord>, LockError> {
        let key = LockKey::new(tenant_id, resource);
        let now = self.clock.now();
        Ok(self.store.get(&key).await?.filter(|r| r.is_live(now)))
    }

    pub async fn list_expired(&self, limit: usize) -> Result<Vec<LockRecord>, LockError> {
        self.store.list_expired(self.clock.now(), limit).await
    }

    pub async fn reap_expired(&self, key: &LockKey) -> Result<bool, LockError> {
        let reaped = self.store.reap_expired(key, self.clock.now()).await?;
        if reaped {
            info!(%key, "expired lock reaped");
        }
        Ok(reaped)
    }

    /// Number of guards from this manager that are still outstanding.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Release every outstanding guard. Called on graceful shutdown.
    pub async fn release_all(&self) -> usize {
        let mut released = 0;
        for (key, holder) in self.held.drain() {
            match self.store.release(&key, &holder).await {
                Ok(true) => released += 1,
                Ok(false) => debug!(%key, "lock already gone at shutdown"),
                Err(e) => warn!(%key, error = %e, "failed to release lock at shutdown"),
            }
        }
        if released > 0 {
            info!(released, "released in-flight locks");
        }
        released
    }

    fn guard(&self, record: LockRecord) -> LockGuard {
        let id = self.held.register(record.key.clone(), record.holder.clone());
        LockGuard {
            id,
            record,
            store: self.store.clone(),
            clock: self.clock.clone(),
            held: self.held.clone(),
            released: false,
        }
    }
}

/// Exclusive hold on one tenant resource.
///
/// Call [`LockGuard::release`] when done. A guard dropped without release
/// schedules a best-effort conditional release; the TTL covers the rest.
pub struct LockGuard {
    id: u64,
    record: LockRecord,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    held: Arc<HeldLocks>,
    released: bool,
}

impl core::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockGuard")
            .field("record", &self.record)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &LockKey {
        &self.record.key
    }

    pub fn holder(&self) -> &HolderId {
        &self.record.holder
    }

    /// Fencing token of this acquisition.
    pub fn version(&self) -> u64 {
        self.record.version
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }

    /// Push the expiry to `now + ttl`. `false` means the lock was lost.
    pub async fn extend(&mut self, ttl: Duration) -> Result<bool, LockError> {
        let now = self.clock.now();
        let expires_at = now + chrono_duration(ttl);
        let extended = self
            .store
            .extend(&self.record.key, &self.record.holder, expires_at, now)
            .await?;
        if extended {
            self.record.expires_at = expires_at;
        } else {
            warn!(key = %self.record.key, "lock lost before extend");
        }
        Ok(extended)
    }

    /// Release if still held by this guard.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        if !self.held.remove(self.id) {
            return Ok(false);
        }
        self.store
            .release(&self.record.key, &self.record.holder)
            .await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released || !self.held.remove(self.id) {
            return;
        }

        let store = self.store.clone();
        let key = self.record.key.clone();
        let holder = self.record.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release(&key, &holder).await {
                        warn!(%key, error = %e, "release of dropped lock guard failed");
                    }
                });
            }
            Err(_) => {
                warn!(%key, "lock guard dropped outside a runtime; waiting for TTL");
            }
        }
    }
}
