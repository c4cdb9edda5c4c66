//! Autonomous operator loop.
//!
//! ## Design
//!
//! One sweep is cooperative and bounded:
//!
//! 1. Collect at most `max_signals` signals (stuck/failed jobs, stale locks,
//!    webhook failures, due follow-ups)
//! 2. Map them to prioritized candidate actions (pure, see `policy`)
//! 3. Execute at most `max_actions`, each charged to the tenant's budget and,
//!    when it mutates tenant-exclusive state, under the tenant's lock
//! 4. Report counts only
//!
//! Overlapping sweeps are expected. They are safe because every mutation goes
//! through the same locks and conditional store updates as everything else.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod actions;
pub mod policy;
pub mod runtime;
pub mod signals;

pub use actions::{
    ActionExecutor, ActionOutcome, Escalation, FollowUpSender, LoggingFollowUpSender, Notifier,
    TracingNotifier,
};
pub use policy::{Action, CandidateAction, Priority};
pub use runtime::OperatorRuntime;
pub use signals::{FollowUp, FollowUpSource, InMemoryFollowUps, Signal, SignalCollector};

use crate::idempotency::IdempotencyError;
use crate::jobs::EngineError;
use crate::lock::LockError;
use crate::rate_limit::RateLimitError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum OperatorError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    /// A follow-up source, sender or notifier failed.
    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_max_signals")]
    pub max_signals: usize,
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    /// How far back failed jobs and abandoned webhooks count as signals.
    #[serde(default = "default_failure_lookback")]
    pub failure_lookback: Duration,
    /// Abandoned webhook deliveries per tenant before escalation.
    #[serde(default = "default_webhook_failure_threshold")]
    pub webhook_failure_threshold: u64,
    #[serde(default = "default_trigger_min_interval")]
    pub trigger_min_interval: Duration,
}

const fn default_max_signals() -> usize {
    200
}

const fn default_max_actions() -> usize {
    20
}

const fn default_failure_lookback() -> Duration {
    Duration::from_secs(3600)
}

const fn default_webhook_failure_threshold() -> u64 {
    5
}

const fn default_trigger_min_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_signals: default_max_signals(),
            max_actions: default_max_actions(),
            failure_lookback: default_failure_lookback(),
            webhook_failure_threshold: default_webhook_failure_threshold(),
            trigger_min_interval: default_trigger_min_interval(),
        }
    }
}

/// Caps for one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub max_signals: usize,
    pub max_actions: usize,
}

/// Aggregate result of a sweep. Counts only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub signals_seen: usize,
    pub actions_planned: usize,
    pub actions_taken: usize,
    /// Planned actions whose condition had cleared before they ran.
    pub already_resolved: usize,
    pub skipped_budget: usize,
    pub skipped_lock: usize,
    pub failed: usize,
    /// Signal sources that could not be read this sweep.
    pub signal_errors: usize,
    pub duration_ms: u64,
}
