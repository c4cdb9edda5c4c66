//! Resumable, per-tenant provisioning jobs.
//!
//! ## Design
//!
//! - At most one active (`pending`/`in_progress`) job per tenant; enqueue is
//!   idempotent and atomic in the store
//! - A run holds the tenant's `provisioning` lock for its whole duration
//! - Progress is persisted after every step; completed steps are never re-run
//! - Every write carries an optimistic version guard
//!
//! ## Components
//!
//! - `ProvisioningJob`: job record with typed, versioned step outputs
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `Pipeline` / `ProvisioningStep`: the ordered step registry
//! - `ProvisioningEngine`: enqueue, run, status and health

pub mod engine;
pub mod pipeline;
pub mod postgres;
pub mod store;
pub mod types;

pub use engine::{
    BatchReport, EngineError, HealthReport, PauseReason, ProvisioningConfig, ProvisioningEngine,
    RunOutcome, TenantHealth,
};
pub use pipeline::{
    Pipeline, PipelineError, ProvisioningStep, StaticStep, StepContext, StepError,
};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    EnqueueOutcome, EnqueueRequest, JobOutputs, JobSource, JobStats, JobStatus, ProvisioningJob,
    StepOutput,
};
