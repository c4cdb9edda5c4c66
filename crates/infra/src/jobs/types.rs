//! Provisioning job record and typed step outputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantflow_core::{DomainError, JobId, TenantId};

/// Job lifecycle: `pending → in_progress → {completed | failed}`.
///
/// `in_progress` is re-entrant: a runner that stops mid-pipeline leaves the
/// job there and the next runner resumes it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }

    /// Pending or in progress; at most one such job per workspace.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

/// Who asked for the job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    #[default]
    Manual,
    Automatic,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Manual => "manual",
            JobSource::Automatic => "automatic",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "manual" => Ok(JobSource::Manual),
            "automatic" => Ok(JobSource::Automatic),
            other => Err(DomainError::validation(format!("unknown job source: {other}"))),
        }
    }
}

/// Typed output of one provisioning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    BillingAccount {
        customer_id: String,
        subscription_id: Option<String>,
    },
    MessagingChannel {
        channel: String,
        address: String,
        external_id: String,
    },
    Workflows {
        workflow_ids: Vec<String>,
    },
    Custom {
        data: serde_json::Value,
    },
}

/// Versioned record of step outputs, keyed by step id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutputs {
    pub schema_version: u32,
    pub steps: BTreeMap<String, StepOutput>,
}

impl JobOutputs {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn get(&self, step_id: &str) -> Option<&StepOutput> {
        self.steps.get(step_id)
    }

    pub fn merge(&mut self, step_id: impl Into<String>, output: StepOutput) {
        self.steps.insert(step_id.into(), output);
    }
}

impl Default for JobOutputs {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            steps: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    pub id: JobId,
    pub workspace_id: TenantId,
    pub status: JobStatus,
    /// 0..=100
    pub progress: u8,
    /// Step ids in the order they completed.
    pub completed_steps: Vec<String>,
    pub result: JobOutputs,
    pub error: Option<String>,
    pub source: JobSource,
    pub metadata: serde_json::Value,
    /// Consecutive retryable step failures.
    pub step_failures: u32,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProvisioningJob {
    pub fn new(
        workspace_id: TenantId,
        source: JobSource,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            workspace_id,
            status: JobStatus::Pending,
            progress: 0,
            completed_steps: Vec::new(),
            result: JobOutputs::default(),
            error: None,
            source,
            metadata,
            step_failures: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn has_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    pub fn mark_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::InProgress;
        self.updated_at = now;
    }

    /// Record a successful step and recompute progress.
    pub fn record_step(
        &mut self,
        step_id: &str,
        output: StepOutput,
        total_steps: usize,
        now: DateTime<Utc>,
    ) {
        if !self.has_completed(step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.result.merge(step_id, output);
        self.progress = progress_percent(self.completed_steps.len(), total_steps);
        self.step_failures = 0;
        self.error = None;
        self.updated_at = now;
    }

    /// Record a step failure. Returns `true` when the job is now `failed`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retryable: bool,
        max_step_failures: u32,
        now: DateTime<Utc>,
    ) -> bool {
        self.error = Some(error.into());
        self.updated_at = now;
        self.step_failures = self.step_failures.saturating_add(1);
        if !retryable || self.step_failures >= max_step_failures.max(1) {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            return true;
        }
        false
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.error = None;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}

pub(crate) fn progress_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub source: JobSource,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    /// `false` when an active job already existed and was returned instead.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::InProgress => self.in_progress += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.completed + self.failed
    }
}
