//! Ordered provisioning steps.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use tenantflow_core::{JobId, TenantId};

use super::types::{JobOutputs, JobSource, StepOutput};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    /// Transient; the job stays `in_progress` and is retried by a later run.
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StepError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("step id cannot be empty")]
    EmptyStepId,
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
}

/// What a step sees when it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub source: JobSource,
    pub metadata: serde_json::Value,
    /// Outputs of the steps that already completed.
    pub outputs: JobOutputs,
}

/// One idempotent unit of provisioning work.
///
/// A step may be re-run after a crash between its side effect and the
/// progress write, so it must tolerate finding its work already done.
#[async_trait]
pub trait ProvisioningStep: Send + Sync {
    /// Stable identifier persisted in `completed_steps`.
    fn id(&self) -> &str;

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn ProvisioningStep>>,
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.step_ids())
            .finish()
    }
}

impl Pipeline {
    pub fn new(steps: Vec<Arc<dyn ProvisioningStep>>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for step in &steps {
            let id = step.id();
            if id.trim().is_empty() {
                return Err(PipelineError::EmptyStepId);
            }
            if !seen.insert(id.to_string()) {
                return Err(PipelineError::DuplicateStep(id.to_string()));
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Arc<dyn ProvisioningStep>] {
        &self.steps
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether every step of this pipeline is in `completed`.
    pub fn is_complete(&self, completed: &[String]) -> bool {
        self.steps
            .iter()
            .all(|s| completed.iter().any(|c| c == s.id()))
    }
}

/// A step that returns a fixed output. Useful for development pipelines.
#[derive(Debug, Clone)]
pub struct StaticStep {
    id: String,
    output: StepOutput,
}

impl StaticStep {
    pub fn new(id: impl Into<String>, output: StepOutput) -> Self {
        Self {
            id: id.into(),
            output,
        }
    }
}

#[async_trait]
impl ProvisioningStep for StaticStep {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
        Ok(self.output.clone())
    }
}
