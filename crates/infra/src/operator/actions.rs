//! Action execution: budget check, tenant lock where needed, then the effect.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tenantflow_core::TenantId;

use super::OperatorError;
use super::policy::{Action, CandidateAction, Priority};
use super::signals::{FollowUp, FollowUpSource};
use crate::jobs::{ProvisioningEngine, RunOutcome};
use crate::lock::{LockManager, ResourceKind};
use crate::rate_limit::RateLimiter;

/// Delivers a follow-up message (AI reply generation and channel delivery
/// live behind this).
#[async_trait]
pub trait FollowUpSender: Send + Sync {
    async fn send(&self, follow_up: &FollowUp) -> Result<(), OperatorError>;
}

#[async_trait]
impl<S> FollowUpSender for Arc<S>
where
    S: FollowUpSender + ?Sized,
{
    async fn send(&self, follow_up: &FollowUp) -> Result<(), OperatorError> {
        (**self).send(follow_up).await
    }
}

/// Logs follow-ups instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFollowUpSender;

#[async_trait]
impl FollowUpSender for LoggingFollowUpSender {
    async fn send(&self, follow_up: &FollowUp) -> Result<(), OperatorError> {
        info!(
            tenant_id = %follow_up.tenant_id,
            follow_up_id = %follow_up.id,
            conversation_id = %follow_up.conversation_id,
            "follow-up due (no sender configured)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub tenant_id: TenantId,
    pub priority: Priority,
    pub reason: String,
}

/// Escalation channel for problems that need a human.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, escalation: &Escalation) -> Result<(), OperatorError>;
}

#[async_trait]
impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    async fn notify(&self, escalation: &Escalation) -> Result<(), OperatorError> {
        (**self).notify(escalation).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, escalation: &Escalation) -> Result<(), OperatorError> {
        warn!(
            tenant_id = %escalation.tenant_id,
            priority = ?escalation.priority,
            reason = %escalation.reason,
            "operator escalation"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Taken,
    /// The condition behind the signal was already resolved; nothing ran.
    NoOp,
    SkippedBudget,
    SkippedLock,
    Failed(String),
}

/// Collaborators an action may touch.
pub struct ActionExecutor {
    pub(crate) engine: Arc<ProvisioningEngine>,
    pub(crate) locks: LockManager,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) follow_ups: Arc<dyn FollowUpSource>,
    pub(crate) sender: Arc<dyn FollowUpSender>,
    pub(crate) notifier: Arc<dyn Notifier>,
}

impl ActionExecutor {
    pub fn new(
        engine: Arc<ProvisioningEngine>,
        locks: LockManager,
        limiter: Arc<RateLimiter>,
        follow_ups: Arc<dyn FollowUpSource>,
        sender: Arc<dyn FollowUpSender>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            locks,
            limiter,
            follow_ups,
            sender,
            notifier,
        }
    }

    /// Execute one candidate. Never returns an error: failures are reported
    /// as `ActionOutcome::Failed` so the sweep continues.
    pub async fn execute(&self, candidate: &CandidateAction) -> ActionOutcome {
        let action = &candidate.action;
        let tenant_id = action.tenant_id();

        match self
            .limiter
            .check_and_consume(tenant_id, action.resource_class())
            .await
        {
            Ok(decision) if !decision.allowed => {
                debug!(%tenant_id, action = action.kind(), "operator action over budget");
                return ActionOutcome::SkippedBudget;
            }
            Ok(_) => {}
            Err(e) => return ActionOutcome::Failed(e.to_string()),
        }

        match self.run(action, candidate.priority).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%tenant_id, action = action.kind(), error = %e, "operator action failed");
                ActionOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run(&self, action: &Action, priority: Priority) -> Result<ActionOutcome, OperatorError> {
        match action {
            Action::ResumeProvisioning { tenant_id, job_id } => {
                match self.engine.run_for_tenant(*tenant_id).await? {
                    RunOutcome::Busy { .. } => {
                        info!(%tenant_id, %job_id, "provisioning lock busy, leaving job to its holder");
                        Ok(ActionOutcome::SkippedLock)
                    }
                    outcome @ (RunOutcome::Completed { .. }
                    | RunOutcome::Paused { .. }
                    | RunOutcome::Retrying { .. }
                    | RunOutcome::Failed { .. }) => {
                        debug!(%tenant_id, ?outcome, "stuck job resumed");
                        Ok(ActionOutcome::Taken)
                    }
                    outcome @ (RunOutcome::Idle
                    | RunOutcome::AlreadyFinished { .. }
                    | RunOutcome::Conflict { .. }) => {
                        debug!(%tenant_id, ?outcome, "nothing to resume");
                        Ok(ActionOutcome::NoOp)
                    }
                }
            }
            Action::SendFollowUp { follow_up } => {
                let Some(guard) = self
                    .locks
                    .try_acquire(follow_up.tenant_id, ResourceKind::Conversation)
                    .await?
                else {
                    info!(tenant_id = %follow_up.tenant_id, "conversation lock busy, skipping follow-up");
                    return Ok(ActionOutcome::SkippedLock);
                };
                let sent = self.sender.send(follow_up).await;
                if sent.is_ok() {
                    self.follow_ups.mark_sent(&follow_up.id).await?;
                }
                guard.release().await?;
                sent.map(|()| ActionOutcome::Taken)
            }
            Action::ReapLock { key } => {
                if self.locks.reap_expired(key).await? {
                    Ok(ActionOutcome::Taken)
                } else {
                    debug!(%key, "lock was renewed before reaping");
                    Ok(ActionOutcome::SkippedLock)
                }
            }
            Action::Escalate { tenant_id, reason } => {
                self.notifier
                    .notify(&Escalation {
                        tenant_id: *tenant_id,
                        priority,
                        reason: reason.clone(),
                    })
                    .await?;
                Ok(ActionOutcome::Taken)
            }
        }
    }
}
