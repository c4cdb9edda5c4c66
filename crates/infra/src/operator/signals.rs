//! Signal aggregation: what the operator observed this sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tenantflow_core::{Clock, JobId, TenantId};

use super::{OperatorConfig, OperatorError};
use crate::idempotency::WebhookEventStore;
use crate::jobs::ProvisioningEngine;
use crate::lock::{LockKey, LockManager};
use crate::time::chrono_duration;

/// A scheduled outbound message owned by the messaging collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: String,
    pub tenant_id: TenantId,
    pub conversation_id: String,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    StuckJob {
        tenant_id: TenantId,
        job_id: JobId,
        idle_secs: i64,
    },
    FailedJob {
        tenant_id: TenantId,
        job_id: JobId,
        error: Option<String>,
    },
    StaleLock {
        key: LockKey,
        expired_at: DateTime<Utc>,
    },
    WebhookFailures {
        tenant_id: TenantId,
        failures: u64,
    },
    DueFollowUp {
        follow_up: FollowUp,
    },
}

impl Signal {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Signal::StuckJob { tenant_id, .. }
            | Signal::FailedJob { tenant_id, .. }
            | Signal::WebhookFailures { tenant_id, .. } => *tenant_id,
            Signal::StaleLock { key, .. } => key.tenant_id,
            Signal::DueFollowUp { follow_up } => follow_up.tenant_id,
        }
    }
}

/// Source of due follow-ups (scheduled messages).
#[async_trait]
pub trait FollowUpSource: Send + Sync {
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUp>, OperatorError>;

    /// Called once the follow-up was sent; it must not be returned again.
    async fn mark_sent(&self, id: &str) -> Result<(), OperatorError>;
}

#[async_trait]
impl<S> FollowUpSource for Arc<S>
where
    S: FollowUpSource + ?Sized,
{
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUp>, OperatorError> {
        (**self).due(now, limit).await
    }

    async fn mark_sent(&self, id: &str) -> Result<(), OperatorError> {
        (**self).mark_sent(id).await
    }
}

/// Follow-ups held in process. Also the default when no messaging backend is
/// wired in.
#[derive(Debug, Default)]
pub struct InMemoryFollowUps {
    pending: Mutex<HashMap<String, FollowUp>>,
}

impl InMemoryFollowUps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, follow_up: FollowUp) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(follow_up.id.clone(), follow_up);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FollowUpSource for InMemoryFollowUps {
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUp>, OperatorError> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| OperatorError::Collaborator("follow-up table poisoned".into()))?;
        let mut due: Vec<FollowUp> = pending
            .values()
            .filter(|f| f.due_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_sent(&self, id: &str) -> Result<(), OperatorError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| OperatorError::Collaborator("follow-up table poisoned".into()))?;
        pending.remove(id);
        Ok(())
    }
}

/// Signals gathered in one sweep plus the number of sources that failed.
#[derive(Debug, Clone, Default)]
pub struct SignalBatch {
    pub signals: Vec<Signal>,
    pub source_errors: usize,
}

/// Reads job, lock, webhook and follow-up state into signals.
pub struct SignalCollector {
    engine: Arc<ProvisioningEngine>,
    locks: LockManager,
    events: Arc<dyn WebhookEventStore>,
    follow_ups: Arc<dyn FollowUpSource>,
    clock: Arc<dyn Clock>,
}

impl SignalCollector {
    pub fn new(
        engine: Arc<ProvisioningEngine>,
        locks: LockManager,
        events: Arc<dyn WebhookEventStore>,
        follow_ups: Arc<dyn FollowUpSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            locks,
            events,
            follow_ups,
            clock,
        }
    }

    /// Collect at most `max_signals` signals. A failing source is logged and
    /// skipped; the others still contribute.
    pub async fn collect(&self, config: &OperatorConfig, max_signals: usize) -> SignalBatch {
        let now = self.clock.now();
        let mut batch = SignalBatch::default();

        let remaining = |batch: &SignalBatch| max_signals.saturating_sub(batch.signals.len());

        // Highest-value sources first so the cap cuts the least useful ones.
        let limit = remaining(&batch);
        if limit > 0 {
            match self.engine.list_stuck(limit).await {
                Ok(jobs) => batch.signals.extend(jobs.into_iter().map(|job| Signal::StuckJob {
                    tenant_id: job.workspace_id,
                    job_id: job.id,
                    idle_secs: (now - job.updated_at).num_seconds(),
                })),
                Err(e) => batch.record_error("stuck_jobs", &e),
            }
        }

        let limit = remaining(&batch);
        if limit > 0 {
            let since = now - chrono_duration(config.failure_lookback);
            match self.events.failure_counts(since, limit).await {
                Ok(counts) => batch.signals.extend(
                    counts
                        .into_iter()
                        .filter(|c| c.failures >= config.webhook_failure_threshold)
                        .map(|c| Signal::WebhookFailures {
                            tenant_id: c.tenant_id,
                            failures: c.failures,
                        }),
                ),
                Err(e) => batch.record_error("webhook_failures", &e),
            }
        }

        let limit = remaining(&batch);
        if limit > 0 {
            let since = now - chrono_duration(config.failure_lookback);
            match self.engine.list_failed_since(since, limit).await {
                Ok(jobs) => batch.signals.extend(jobs.into_iter().map(|job| Signal::FailedJob {
                    tenant_id: job.workspace_id,
                    job_id: job.id,
                    error: job.error,
                })),
                Err(e) => batch.record_error("failed_jobs", &e),
            }
        }

        let limit = remaining(&batch);
        if limit > 0 {
            match self.follow_ups.due(now, limit).await {
                Ok(due) => batch
                    .signals
                    .extend(due.into_iter().map(|follow_up| Signal::DueFollowUp { follow_up })),
                Err(e) => batch.record_error("follow_ups", &e),
            }
        }

        let limit = remaining(&batch);
        if limit > 0 {
            match self.locks.list_expired(limit).await {
                Ok(records) => batch.signals.extend(records.into_iter().map(|r| Signal::StaleLock {
                    key: r.key,
                    expired_at: r.expires_at,
                })),
                Err(e) => batch.record_error("stale_locks", &e),
            }
        }

        batch.signals.truncate(max_signals);
        batch
    }
}

impl SignalBatch {
    fn record_error(&mut self, source: &str, err: &dyn std::fmt::Display) {
        warn!(source, error = %err, "signal source failed");
        self.source_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use tenantflow_core::ManualClock;

    use super::*;

    fn follow_up(id: &str, due_at: DateTime<Utc>) -> FollowUp {
        FollowUp {
            id: id.into(),
            tenant_id: TenantId::new(),
            conversation_id: format!("conv-{id}"),
            due_at,
            context: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn only_due_follow_ups_are_returned_oldest_first() {
        let clock = ManualClock::starting_now();
        let now = clock.now();
        let source = InMemoryFollowUps::new();
        source.schedule(follow_up("later", now + chrono::Duration::minutes(5)));
        source.schedule(follow_up("b", now - chrono::Duration::minutes(1)));
        source.schedule(follow_up("a", now - chrono::Duration::minutes(2)));

        let due = source.due(now, 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        source.mark_sent("a").await.unwrap();
        assert_eq!(source.due(now, 10).await.unwrap().len(), 1);
        assert_eq!(source.pending_count(), 2);
    }
}
