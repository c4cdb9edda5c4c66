//! Idempotent processing of external events.
//!
//! ## Design
//!
//! - Identity is strictly `(source, external_id)`; the payload hash is stored
//!   for forensics only
//! - The transition into `processing` is a single atomic claim in the store,
//!   so concurrent deliveries of the same event have exactly one winner
//! - `completed` is terminal: replays return `duplicate` without invoking the
//!   handler
//! - A store that cannot be consulted fails the call; the guard never runs a
//!   handler without its ledger
//!
//! ## Components
//!
//! - `WebhookEventStore`: the ledger (in-memory or Postgres)
//! - `IdempotencyGuard`: claim → run handler → record outcome

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use tenantflow_core::{Clock, TenantId};
use tenantflow_events::{HandlerError, WebhookKey};

use crate::time::chrono_duration;

pub mod postgres;
pub mod store;

pub use postgres::PostgresWebhookEventStore;
pub use store::{
    ClaimOutcome, ClaimRequest, FailureDisposition, InMemoryWebhookEventStore, TenantFailureCount,
    WebhookEventFilter, WebhookEventStore,
};

/// Idempotency store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdempotencyError {
    /// The ledger could not be consulted (connection/pool/poisoned state).
    #[error("idempotency store unavailable: {0}")]
    Unavailable(String),
    #[error("webhook event not found: {0}")]
    NotFound(WebhookKey),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Idempotency configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Deliveries allowed before an event is abandoned.
    pub max_attempts: u32,
    /// How long a `processing` claim may live before another delivery may
    /// reclaim it.
    pub processing_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            processing_timeout: Duration::from_secs(300),
        }
    }
}

/// Hex-encoded SHA-256 of a payload.
pub fn payload_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// One unit of idempotent work.
#[derive(Debug, Clone)]
pub struct IdempotentRequest {
    pub key: WebhookKey,
    pub tenant_id: Option<TenantId>,
    pub payload: serde_json::Value,
    pub payload_hash: String,
}

impl IdempotentRequest {
    pub fn new(key: WebhookKey, tenant_id: Option<TenantId>, payload: serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        Self {
            key,
            tenant_id,
            payload_hash: payload_hash(&bytes),
            payload,
        }
    }

    /// Hash the exact wire bytes instead of the re-serialized JSON.
    pub fn with_raw_body(mut self, body: &[u8]) -> Self {
        self.payload_hash = payload_hash(body);
        self
    }
}

/// Result of an idempotent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// The business effect has happened (now or on an earlier delivery).
    pub processed: bool,
    /// This delivery did not run the handler.
    pub duplicate: bool,
}

impl ProcessOutcome {
    pub const PROCESSED: Self = Self {
        processed: true,
        duplicate: false,
    };
    pub const ALREADY_PROCESSED: Self = Self {
        processed: true,
        duplicate: true,
    };
    pub const NOT_PROCESSED_DUPLICATE: Self = Self {
        processed: false,
        duplicate: true,
    };
}

/// Failure of an idempotent invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    /// The ledger failed; no exclusivity could be claimed.
    #[error(transparent)]
    Store(#[from] IdempotencyError),

    /// The handler failed. `abandoned` is true when the event will not be
    /// attempted again (permanent error or attempts exhausted).
    #[error("handler failed (attempt {attempts}, abandoned: {abandoned}): {error}")]
    Handler {
        error: HandlerError,
        attempts: u32,
        abandoned: bool,
    },
}

/// Runs handlers at most once per `(source, external_id)`.
pub struct IdempotencyGuard {
    store: Arc<dyn WebhookEventStore>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(
        store: Arc<dyn WebhookEventStore>,
        clock: Arc<dyn Clock>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WebhookEventStore> {
        &self.store
    }

    /// Claim the event, run `handler`, and record the outcome.
    ///
    /// Handler errors are recorded on the event and returned so the caller can
    /// pick the provider-facing response.
    #[instrument(skip(self, request, handler), fields(key = %request.key), err)]
    pub async fn process<F, Fut>(
        &self,
        request: IdempotentRequest,
        handler: F,
    ) -> Result<ProcessOutcome, ProcessError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), HandlerError>> + Send,
    {
        let now = self.clock.now();
        let key = request.key.clone();
        let claim = ClaimRequest {
            key: request.key,
            workspace_id: request.tenant_id,
            payload: request.payload,
            payload_hash: request.payload_hash,
            max_attempts: self.config.max_attempts.max(1),
            now,
            stale_before: now - chrono_duration(self.config.processing_timeout),
        };

        let claimed = match self.store.claim(claim).await? {
            ClaimOutcome::Claimed(event) => event,
            ClaimOutcome::AlreadyCompleted(_) => {
                debug!(%key, "event already completed");
                return Ok(ProcessOutcome::ALREADY_PROCESSED);
            }
            ClaimOutcome::InFlight(_) => {
                debug!(%key, "event is being processed by another invocation");
                return Ok(ProcessOutcome::NOT_PROCESSED_DUPLICATE);
            }
            ClaimOutcome::Exhausted(event) => {
                debug!(%key, attempts = event.attempts, "event abandoned after max attempts");
                return Ok(ProcessOutcome::NOT_PROCESSED_DUPLICATE);
            }
        };

        match handler().await {
            Ok(()) => {
                if let Err(e) = self.store.complete(&key, self.clock.now()).await {
                    // The effect happened but the ledger does not know; the
                    // claim will be reclaimable after the processing timeout.
                    error!(%key, error = %e, "failed to mark event completed");
                    return Err(e.into());
                }
                info!(%key, attempts = claimed.attempts, "event processed");
                Ok(ProcessOutcome::PROCESSED)
            }
            Err(handler_error) => {
                let disposition = if handler_error.is_retryable() {
                    FailureDisposition::Retry
                } else {
                    FailureDisposition::Abandon
                };
                let updated = self
                    .store
                    .fail(&key, &handler_error.to_string(), disposition, self.clock.now())
                    .await?;
                let abandoned = updated.status == tenantflow_events::WebhookStatus::Failed;
                warn!(
                    %key,
                    attempts = updated.attempts,
                    abandoned,
                    error = %handler_error,
                    "event handler failed"
                );
                Err(ProcessError::Handler {
                    error: handler_error,
                    attempts: updated.attempts,
                    abandoned,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tenantflow_core::ManualClock;
    use tenantflow_events::{Provider, WebhookStatus};

    use super::*;

    fn setup(max_attempts: u32) -> (IdempotencyGuard, Arc<InMemoryWebhookEventStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryWebhookEventStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let guard = IdempotencyGuard::new(
            store.clone(),
            clock.clone(),
            IdempotencyConfig {
                max_attempts,
                processing_timeout: Duration::from_secs(60),
            },
        );
        (guard, store, clock)
    }

    fn request(id: &str) -> IdempotentRequest {
        IdempotentRequest::new(
            WebhookKey::new(Provider::Stripe, id).unwrap(),
            Some(TenantId::new()),
            serde_json::json!({"id": id}),
        )
    }

    #[tokio::test]
    async fn replays_run_the_handler_exactly_once() {
        let (guard, store, _) = setup(3);
        let calls = Arc::new(AtomicUsize::new(0));

        for n in 0..5 {
            let calls = calls.clone();
            let outcome = guard
                .process(request("evt_123"), || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();

            assert!(outcome.processed);
            assert_eq!(outcome.duplicate, n > 0);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let key = WebhookKey::new(Provider::Stripe, "evt_123").unwrap();
        let event = store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Completed);
        assert!(event.processed_at.is_some());
        assert_eq!(event.attempts, 1);
    }

    #[tokio::test]
    async fn concurrent_delivery_observes_in_flight_claim() {
        let (guard, _, _) = setup(3);
        let guard = Arc::new(guard);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .process(request("evt_123"), || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };

        started_rx.await.unwrap();
        let second = guard
            .process(request("evt_123"), || async { panic!("must not run") })
            .await
            .unwrap();
        assert_eq!(second, ProcessOutcome::NOT_PROCESSED_DUPLICATE);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), ProcessOutcome::PROCESSED);

        let third = guard
            .process(request("evt_123"), || async { panic!("must not run") })
            .await
            .unwrap();
        assert_eq!(third, ProcessOutcome::ALREADY_PROCESSED);
    }

    #[tokio::test]
    async fn retryable_failures_stay_pending_until_attempts_run_out() {
        let (guard, store, _) = setup(2);
        let key = WebhookKey::new(Provider::Stripe, "evt_flaky").unwrap();

        let err = guard
            .process(request("evt_flaky"), || async { Err(HandlerError::retryable("timeout")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Handler { abandoned: false, attempts: 1, .. }));
        let event = store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Pending);
        assert_eq!(event.error.as_deref(), Some("retryable: timeout"));

        let err = guard
            .process(request("evt_flaky"), || async { Err(HandlerError::retryable("timeout")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Handler { abandoned: true, attempts: 2, .. }));

        let outcome = guard
            .process(request("evt_flaky"), || async { panic!("must not run") })
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::NOT_PROCESSED_DUPLICATE);
        assert_eq!(store.get(&key).await.unwrap().unwrap().status, WebhookStatus::Failed);
    }

    #[tokio::test]
    async fn permanent_failure_abandons_immediately() {
        let (guard, store, _) = setup(5);
        let err = guard
            .process(request("evt_bad"), || async { Err(HandlerError::permanent("unknown plan")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Handler { abandoned: true, .. }));

        let key = WebhookKey::new(Provider::Stripe, "evt_bad").unwrap();
        let event = store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Failed);
        assert!(event.is_exhausted());
    }

    #[tokio::test]
    async fn stale_processing_claim_is_reclaimed() {
        let (guard, store, clock) = setup(3);
        let key = WebhookKey::new(Provider::Twilio, "SM1").unwrap();

        // Simulate a crashed invocation: claimed but never completed.
        let now = clock.now();
        store
            .claim(ClaimRequest {
                key: key.clone(),
                workspace_id: None,
                payload: serde_json::json!({}),
                payload_hash: payload_hash(b"{}"),
                max_attempts: 3,
                now,
                stale_before: now - chrono::Duration::seconds(60),
            })
            .await
            .unwrap();

        let req = IdempotentRequest::new(key.clone(), None, serde_json::json!({}));
        let outcome = guard.process(req.clone(), || async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NOT_PROCESSED_DUPLICATE);

        clock.advance(Duration::from_secs(61));
        let outcome = guard.process(req, || async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::PROCESSED);
        assert_eq!(store.get(&key).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn crashed_final_attempt_is_failed_after_the_timeout() {
        let (guard, store, clock) = setup(1);
        let key = WebhookKey::new(Provider::Stripe, "evt_lost").unwrap();
        let now = clock.now();
        store
            .claim(ClaimRequest {
                key: key.clone(),
                workspace_id: None,
                payload: serde_json::json!({}),
                payload_hash: payload_hash(b"{}"),
                max_attempts: 1,
                now,
                stale_before: now - chrono::Duration::seconds(60),
            })
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3600));
        let req = IdempotentRequest::new(key.clone(), None, serde_json::json!({}));
        let outcome = guard.process(req, || async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NOT_PROCESSED_DUPLICATE);

        let event = store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Failed);
        assert_eq!(event.error.as_deref(), Some(store::PROCESSING_TIMEOUT_ERROR));
    }

    #[test]
    fn payload_hash_is_hex_sha256() {
        assert_eq!(
            payload_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
