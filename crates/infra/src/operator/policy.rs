//! Pure mapping from signals to prioritized candidate actions.
//!
//! | Signal | Action | Priority |
//! |--------|--------|----------|
//! | `WebhookFailures` | `Escalate` | critical |
//! | `StuckJob` | `ResumeProvisioning` | high |
//! | `FailedJob` | `Escalate` | high |
//! | `DueFollowUp` | `SendFollowUp` | normal |
//! | `StaleLock` | `ReapLock` | low |
//!
//! Candidates are deduplicated per tenant and action (the highest priority
//! wins), ordered by priority, then capped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tenantflow_core::{JobId, TenantId};

use super::signals::{FollowUp, Signal};
use crate::lock::LockKey;
use crate::rate_limit::ResourceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    ResumeProvisioning { tenant_id: TenantId, job_id: JobId },
    SendFollowUp { follow_up: FollowUp },
    ReapLock { key: LockKey },
    Escalate { tenant_id: TenantId, reason: String },
}

impl Action {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Action::ResumeProvisioning { tenant_id, .. } | Action::Escalate { tenant_id, .. } => {
                *tenant_id
            }
            Action::SendFollowUp { follow_up } => follow_up.tenant_id,
            Action::ReapLock { key } => key.tenant_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::ResumeProvisioning { .. } => "resume_provisioning",
            Action::SendFollowUp { .. } => "send_follow_up",
            Action::ReapLock { .. } => "reap_lock",
            Action::Escalate { .. } => "escalate",
        }
    }

    /// Budget the action is charged against.
    pub fn resource_class(&self) -> ResourceClass {
        match self {
            Action::ResumeProvisioning { .. } => ResourceClass::Provisioning,
            Action::SendFollowUp { .. } => ResourceClass::OutboundMessage,
            Action::ReapLock { .. } | Action::Escalate { .. } => ResourceClass::OperatorTrigger,
        }
    }

    fn dedup_key(&self) -> (TenantId, String) {
        let kind = match self {
            Action::ReapLock { key } => format!("reap_lock:{}", key.resource),
            other => other.kind().to_string(),
        };
        (self.tenant_id(), kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAction {
    pub action: Action,
    pub priority: Priority,
}

fn candidate_for(signal: &Signal) -> CandidateAction {
    let (action, priority) = match signal {
        Signal::WebhookFailures {
            tenant_id,
            failures,
        } => (
            Action::Escalate {
                tenant_id: *tenant_id,
                reason: format!("{failures} webhook deliveries abandoned"),
            },
            Priority::Critical,
        ),
        Signal::StuckJob {
            tenant_id, job_id, ..
        } => (
            Action::ResumeProvisioning {
                tenant_id: *tenant_id,
                job_id: *job_id,
            },
            Priority::High,
        ),
        Signal::FailedJob {
            tenant_id,
            job_id,
            error,
        } => (
            Action::Escalate {
                tenant_id: *tenant_id,
                reason: format!(
                    "provisioning job {job_id} failed: {}",
                    error.as_deref().unwrap_or("unknown error")
                ),
            },
            Priority::High,
        ),
        Signal::DueFollowUp { follow_up } => (
            Action::SendFollowUp {
                follow_up: follow_up.clone(),
            },
            Priority::Normal,
        ),
        Signal::StaleLock { key, .. } => (Action::ReapLock { key: key.clone() }, Priority::Low),
    };
    CandidateAction { action, priority }
}

/// Candidate actions for `signals`, highest priority first, at most
/// `max_actions` long.
pub fn evaluate(signals: &[Signal], max_actions: usize) -> Vec<CandidateAction> {
    let mut best: HashMap<(TenantId, String), usize> = HashMap::new();
    let mut candidates: Vec<CandidateAction> = Vec::with_capacity(signals.len());

    for signal in signals {
        let candidate = candidate_for(signal);
        match best.get(&candidate.action.dedup_key()) {
            Some(&idx) => {
                if candidate.priority > candidates[idx].priority {
                    candidates[idx] = candidate;
                }
            }
            None => {
                best.insert(candidate.action.dedup_key(), candidates.len());
                candidates.push(candidate);
            }
        }
    }

    // Stable: equal priorities keep signal order.
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
    candidates.truncate(max_actions);
    candidates
}
