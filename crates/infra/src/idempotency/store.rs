use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantflow_core::TenantId;
use tenantflow_events::{Provider, WebhookEvent, WebhookKey, WebhookStatus};

use super::IdempotencyError;

/// Atomic claim request for one delivery.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub key: WebhookKey,
    pub workspace_id: Option<TenantId>,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub max_attempts: u32,
    pub now: DateTime<Utc>,
    /// `processing` rows last touched before this instant are reclaimable.
    pub stale_before: DateTime<Utc>,
}

/// Result of a claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller owns the event; its status is now `processing`.
    Claimed(WebhookEvent),
    AlreadyCompleted(WebhookEvent),
    /// Another invocation holds a live claim.
    InFlight(WebhookEvent),
    /// Abandoned; no further attempts.
    Exhausted(WebhookEvent),
}

/// How to record a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending` unless attempts are used up.
    Retry,
    /// Straight to `failed`, attempts pinned to the cap.
    Abandon,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventFilter {
    pub status: Option<WebhookStatus>,
    pub source: Option<Provider>,
    pub workspace_id: Option<TenantId>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantFailureCount {
    pub tenant_id: TenantId,
    pub failures: u64,
}

/// The webhook idempotency ledger.
///
/// `claim` must be atomic with respect to concurrent claims for the same key;
/// everything else is a plain conditional update.
#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, IdempotencyError>;

    /// Mark a claimed event completed. Returns `false` when the event was no
    /// longer in `processing` (e.g. reclaimed after a timeout).
    async fn complete(&self, key: &WebhookKey, now: DateTime<Utc>)
    -> Result<bool, IdempotencyError>;

    async fn fail(
        &self,
        key: &WebhookKey,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, IdempotencyError>;

    async fn get(&self, key: &WebhookKey) -> Result<Option<WebhookEvent>, IdempotencyError>;

    /// Newest first.
    async fn list(&self, filter: &WebhookEventFilter)
    -> Result<Vec<WebhookEvent>, IdempotencyError>;

    /// Tenants with abandoned deliveries updated since `since`, most failures
    /// first.
    async fn failure_counts(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TenantFailureCount>, IdempotencyError>;
}

#[async_trait]
impl<S> WebhookEventStore for Arc<S>
where
    S: WebhookEventStore + ?Sized,
{
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, IdempotencyError> {
        (**self).claim(request).await
    }

    async fn complete(
        &self,
        key: &WebhookKey,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        (**self).complete(key, now).await
    }

    async fn fail(
        &self,
        key: &WebhookKey,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, IdempotencyError> {
        (**self).fail(key, error, disposition, now).await
    }

    async fn get(&self, key: &WebhookKey) -> Result<Option<WebhookEvent>, IdempotencyError> {
        (**self).get(key).await
    }

    async fn list(
        &self,
        filter: &WebhookEventFilter,
    ) -> Result<Vec<WebhookEvent>, IdempotencyError> {
        (**self).list(filter).await
    }

    async fn failure_counts(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TenantFailureCount>, IdempotencyError> {
        (**self).failure_counts(since, limit).await
    }
}

/// In-memory ledger for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryWebhookEventStore {
    events: Mutex<HashMap<WebhookKey, WebhookEvent>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<WebhookKey, WebhookEvent>>, IdempotencyError>
    {
        self.events
            .lock()
            .map_err(|_| IdempotencyError::Unavailable("webhook ledger lock poisoned".into()))
    }
}

/// Error recorded when a claim on the last allowed attempt times out.
pub const PROCESSING_TIMEOUT_ERROR: &str = "processing timeout";

/// Decide a claim against the current row. Shared by the in-memory store and
/// the Postgres store's "no row returned" path.
pub(crate) fn classify_existing(event: &WebhookEvent, stale_before: DateTime<Utc>) -> ClaimOutcome {
    match event.status {
        WebhookStatus::Completed => ClaimOutcome::AlreadyCompleted(event.clone()),
        WebhookStatus::Processing if event.updated_at > stale_before => {
            ClaimOutcome::InFlight(event.clone())
        }
        _ => ClaimOutcome::Exhausted(event.clone()),
    }
}

fn is_claimable(event: &WebhookEvent, stale_before: DateTime<Utc>) -> bool {
    if event.is_exhausted() {
        return false;
    }
    match event.status {
        WebhookStatus::Pending => true,
        WebhookStatus::Processing => event.updated_at <= stale_before,
        WebhookStatus::Completed | WebhookStatus::Failed => false,
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryWebhookEventStore {
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, IdempotencyError> {
        let mut events = self.lock()?;

        let Some(existing) = events.get_mut(&request.key) else {
            let event = WebhookEvent {
                key: request.key.clone(),
                workspace_id: request.workspace_id,
                status: WebhookStatus::Processing,
                attempts: 1,
                max_attempts: request.max_attempts,
                payload: request.payload,
                payload_hash: request.payload_hash,
                error: None,
                created_at: request.now,
                updated_at: request.now,
                processed_at: None,
            };
            events.insert(request.key, event.clone());
            return Ok(ClaimOutcome::Claimed(event));
        };

        if existing.status == WebhookStatus::Processing
            && existing.updated_at <= request.stale_before
            && existing.is_exhausted()
        {
            existing.status = WebhookStatus::Failed;
            existing.error = Some(PROCESSING_TIMEOUT_ERROR.to_string());
            existing.updated_at = request.now;
            return Ok(ClaimOutcome::Exhausted(existing.clone()));
        }

        if !is_claimable(existing, request.stale_before) {
            return Ok(classify_existing(existing, request.stale_before));
        }

        existing.status = WebhookStatus::Processing;
        existing.attempts += 1;
        existing.updated_at = request.now;
        if existing.workspace_id.is_none() {
            existing.workspace_id = request.workspace_id;
        }
        Ok(ClaimOutcome::Claimed(existing.clone()))
    }

    async fn complete(
        &self,
        key: &WebhookKey,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        let mut events = self.lock()?;
        let event = events
            .get_mut(key)
            .ok_or_else(|| IdempotencyError::NotFound(key.clone()))?;
        if event.status != WebhookStatus::Processing {
            return Ok(false);
        }
        event.status = WebhookStatus::Completed;
        event.error = None;
        event.updated_at = now;
        event.processed_at = Some(now);
        Ok(true)
    }

    async fn fail(
        &self,
        key: &WebhookKey,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, IdempotencyError> {
        let mut events = self.lock()?;
        let event = events
            .get_mut(key)
            .ok_or_else(|| IdempotencyError::NotFound(key.clone()))?;
        if event.status != WebhookStatus::Processing {
            return Ok(event.clone());
        }

        if disposition == FailureDisposition::Abandon {
            event.attempts = event.attempts.max(event.max_attempts);
        }
        event.status = if event.is_exhausted() {
            WebhookStatus::Failed
        } else {
            WebhookStatus::Pending
        };
        event.error = Some(error.to_string());
        event.updated_at = now;
        Ok(event.clone())
    }

    async fn get(&self, key: &WebhookKey) -> Result<Option<WebhookEvent>, IdempotencyError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn list(
        &self,
        filter: &WebhookEventFilter,
    ) -> Result<Vec<WebhookEvent>, IdempotencyError> {
        let events = self.lock()?;
        let mut matching: Vec<WebhookEvent> = events
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| filter.source.is_none_or(|s| e.key.source == s))
            .filter(|e| filter.workspace_id.is_none_or(|t| e.workspace_id == Some(t)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn failure_counts(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TenantFailureCount>, IdempotencyError> {
        let events = self.lock()?;
        let mut counts: HashMap<TenantId, u64> = HashMap::new();
        for event in events.values() {
            if event.status != WebhookStatus::Failed || event.updated_at < since {
                continue;
            }
            if let Some(tenant_id) = event.workspace_id {
                *counts.entry(tenant_id).or_default() += 1;
            }
        }

        let mut counts: Vec<TenantFailureCount> = counts
            .into_iter()
            .map(|(tenant_id, failures)| TenantFailureCount {
                tenant_id,
                failures,
            })
            .collect();
        counts.sort_by(|a, b| b.failures.cmp(&a.failures).then(a.tenant_id.cmp(&b.tenant_id)));
        counts.truncate(limit);
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn claim(key: &WebhookKey, tenant: Option<TenantId>, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            key: key.clone(),
            workspace_id: tenant,
            payload: serde_json::json!({}),
            payload_hash: "h".into(),
            max_attempts: 3,
            now,
            stale_before: now - Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn failure_counts_group_abandoned_events_by_tenant() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let noisy = TenantId::new();
        let quiet = TenantId::new();

        for (i, tenant) in [noisy, noisy, quiet].into_iter().enumerate() {
            let key = WebhookKey::new(Provider::Whatsapp, format!("wamid.{i}")).unwrap();
            store.claim(claim(&key, Some(tenant), now)).await.unwrap();
            store
                .fail(&key, "bad", FailureDisposition::Abandon, now)
                .await
                .unwrap();
        }

        let counts = store
            .failure_counts(now - Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].tenant_id, noisy);
        assert_eq!(counts[0].failures, 2);

        assert!(store.failure_counts(now + Duration::seconds(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timed_out_final_attempt_is_marked_failed() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let tenant = TenantId::new();
        let key = WebhookKey::new(Provider::Stripe, "evt_crashed").unwrap();

        let first = ClaimRequest {
            max_attempts: 1,
            ..claim(&key, Some(tenant), now)
        };
        store.claim(first).await.unwrap();

        let later = now + Duration::hours(1);
        let retry = ClaimRequest {
            max_attempts: 1,
            ..claim(&key, Some(tenant), later)
        };
        let outcome = store.claim(retry).await.unwrap();
        let ClaimOutcome::Exhausted(event) = outcome else {
            panic!("expected exhausted, got {outcome:?}");
        };
        assert_eq!(event.status, WebhookStatus::Failed);
        assert_eq!(event.error.as_deref(), Some(PROCESSING_TIMEOUT_ERROR));

        let counts = store.failure_counts(now, 10).await.unwrap();
        assert_eq!(counts[0].tenant_id, tenant);
        assert_eq!(counts[0].failures, 1);
    }

    #[tokio::test]
    async fn complete_is_a_no_op_once_terminal() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let key = WebhookKey::new(Provider::Email, "msg-1").unwrap();

        store.claim(claim(&key, None, now)).await.unwrap();
        assert!(store.complete(&key, now).await.unwrap());
        assert!(!store.complete(&key, now).await.unwrap());

        let outcome = store.claim(claim(&key, None, now)).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::AlreadyCompleted(_)));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_tenant() {
        let store = InMemoryWebhookEventStore::new();
        let now = Utc::now();
        let tenant = TenantId::new();

        let done = WebhookKey::new(Provider::Stripe, "evt_done").unwrap();
        let busy = WebhookKey::new(Provider::Stripe, "evt_busy").unwrap();
        store.claim(claim(&done, Some(tenant), now)).await.unwrap();
        store.complete(&done, now).await.unwrap();
        store.claim(claim(&busy, Some(tenant), now)).await.unwrap();

        let completed = store
            .list(&WebhookEventFilter {
                status: Some(WebhookStatus::Completed),
                workspace_id: Some(tenant),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].key, done);

        let none = store
            .list(&WebhookEventFilter {
                workspace_id: Some(TenantId::new()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
