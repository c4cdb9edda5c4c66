//! Resumable provisioning runner.
//!
//! A run takes the tenant's `provisioning` lock, reloads the job under it,
//! and executes the remaining pipeline steps in order, persisting after every
//! step. Whatever stops a run (busy lock, step failure, budget, crash) leaves
//! the job in a state the next run can resume from.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use tenantflow_core::{Clock, ExpectedVersion, JobId, TenantId};

use super::pipeline::{Pipeline, StepContext, StepError};
use super::store::{JobStore, JobStoreError};
use super::types::{EnqueueOutcome, EnqueueRequest, JobStats, JobStatus, ProvisioningJob};
use crate::lock::{LockError, LockGuard, LockManager, LockOptions, LockRecord, ResourceKind};
use crate::time::chrono_duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Wall-clock budget of one run; checked between steps.
    pub run_budget: Duration,
    /// Upper bound for a single step invocation.
    pub step_timeout: Duration,
    /// Consecutive retryable failures before the job is failed.
    pub max_step_failures: u32,
    /// Active jobs idle for longer than this are reported as stuck.
    pub stuck_after: Duration,
    pub lock_ttl: Duration,
    /// Jobs attempted per scheduled tick.
    pub batch_size: usize,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            run_budget: Duration::from_secs(60),
            step_timeout: Duration::from_secs(30),
            max_step_failures: 5,
            stuck_after: Duration::from_secs(15 * 60),
            lock_ttl: Duration::from_secs(300),
            batch_size: 5,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    BudgetExhausted,
    LockLost,
}

/// What one run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing to run.
    Idle,
    /// Another runner holds the tenant's lock; the job was not touched.
    Busy { job_id: JobId, tenant_id: TenantId },
    /// The job reached a terminal state before this run got the lock.
    AlreadyFinished { job_id: JobId, status: JobStatus },
    Completed { job_id: JobId, steps_run: usize },
    /// Stopped between steps; the job stays `in_progress`.
    Paused {
        job_id: JobId,
        steps_run: usize,
        reason: PauseReason,
    },
    Retrying {
        job_id: JobId,
        step: String,
        error: String,
    },
    Failed {
        job_id: JobId,
        step: String,
        error: String,
    },
    /// Another writer changed the job mid-run.
    Conflict { job_id: JobId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub picked: usize,
    pub completed: usize,
    pub progressed: usize,
    pub busy: usize,
    pub failed: usize,
    pub errors: usize,
    pub outcomes: Vec<RunOutcome>,
}

impl BatchReport {
    fn record(&mut self, outcome: RunOutcome) {
        match &outcome {
            RunOutcome::Completed { .. } => self.completed += 1,
            RunOutcome::Paused { .. } | RunOutcome::Retrying { .. } => self.progressed += 1,
            RunOutcome::Busy { .. } => self.busy += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
            RunOutcome::Idle
            | RunOutcome::AlreadyFinished { .. }
            | RunOutcome::Conflict { .. } => {}
        }
        self.outcomes.push(outcome);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantHealth {
    pub tenant_id: TenantId,
    pub job: ProvisioningJob,
    pub stuck: bool,
    /// Live provisioning lock holder, if any.
    pub lock: Option<LockRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub stats: JobStats,
    pub stuck: usize,
    pub tenants: Vec<TenantHealth>,
}

pub struct ProvisioningEngine {
    store: Arc<dyn JobStore>,
    locks: LockManager,
    pipeline: Arc<Pipeline>,
    clock: Arc<dyn Clock>,
    config: ProvisioningConfig,
}

impl ProvisioningEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: LockManager,
        pipeline: Arc<Pipeline>,
        clock: Arc<dyn Clock>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            locks,
            pipeline,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Create a job for the tenant unless one is already active.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, source = request.source.as_str()), err)]
    pub async fn enqueue(
        &self,
        tenant_id: TenantId,
        request: EnqueueRequest,
    ) -> Result<EnqueueOutcome, EngineError> {
        let job = ProvisioningJob::new(tenant_id, request.source, request.metadata, self.clock.now());
        let (job, created) = self.store.create_if_absent(job).await?;
        if created {
            info!(job_id = %job.id, "provisioning job enqueued");
        } else {
            debug!(job_id = %job.id, status = job.status.as_str(), "active provisioning job already exists");
        }
        Ok(EnqueueOutcome {
            job_id: job.id,
            created,
        })
    }

    /// Latest job snapshot for the tenant.
    pub async fn status(&self, tenant_id: TenantId) -> Result<Option<ProvisioningJob>, EngineError> {
        Ok(self.store.latest_for_tenant(tenant_id).await?)
    }

    /// Run up to `max_jobs` runnable jobs, oldest first, resumptions first.
    ///
    /// A failure on one job is logged and counted; the batch continues.
    #[instrument(skip(self))]
    pub async fn run_batch(&self, max_jobs: usize) -> Result<BatchReport, EngineError> {
        let jobs = self.store.list_runnable(max_jobs).await?;
        let mut report = BatchReport {
            picked: jobs.len(),
            ..Default::default()
        };

        for job in jobs {
            match self.run_job(job.id, job.workspace_id).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "provisioning run failed");
                    report.errors += 1;
                }
            }
        }

        if report.picked > 0 {
            info!(
                picked = report.picked,
                completed = report.completed,
                progressed = report.progressed,
                busy = report.busy,
                failed = report.failed,
                errors = report.errors,
                "provisioning batch finished"
            );
        }
        Ok(report)
    }

    /// Run the oldest runnable job.
    pub async fn run_next(&self) -> Result<RunOutcome, EngineError> {
        let Some(job) = self.store.list_runnable(1).await?.into_iter().next() else {
            return Ok(RunOutcome::Idle);
        };
        self.run_job(job.id, job.workspace_id).await
    }

    /// Run the tenant's active job, if any.
    pub async fn run_for_tenant(&self, tenant_id: TenantId) -> Result<RunOutcome, EngineError> {
        match self.store.latest_for_tenant(tenant_id).await? {
            Some(job) if job.is_active() => self.run_job(job.id, tenant_id).await,
            _ => Ok(RunOutcome::Idle),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn run_job(&self, job_id: JobId, tenant_id: TenantId) -> Result<RunOutcome, EngineError> {
        let options = LockOptions::try_once(self.config.lock_ttl);
        let Some(mut guard) = self
            .locks
            .acquire(tenant_id, ResourceKind::Provisioning, options)
            .await?
        else {
            info!("provisioning lock busy, skipping");
            return Ok(RunOutcome::Busy { job_id, tenant_id });
        };

        let outcome = match self.run_locked(job_id, &mut guard).await {
            Err(EngineError::Store(JobStoreError::Conflict { .. })) => {
                warn!("job modified concurrently, aborting run");
                Ok(RunOutcome::Conflict { job_id })
            }
            other => other,
        };

        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release provisioning lock; it will expire");
        }
        outcome
    }

    async fn run_locked(
        &self,
        job_id: JobId,
        guard: &mut LockGuard,
    ) -> Result<RunOutcome, EngineError> {
        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_active() {
            return Ok(RunOutcome::AlreadyFinished {
                job_id,
                status: job.status,
            });
        }

        let deadline = self.clock.now() + chrono_duration(self.config.run_budget);
        if job.status == JobStatus::Pending {
            job.mark_in_progress(self.clock.now());
            job = self.persist(&job).await?;
        }

        let total = self.pipeline.len();
        let mut steps_run = 0;
        for step in self.pipeline.steps() {
            let step_id = step.id();
            if job.has_completed(step_id) {
                continue;
            }
            if self.clock.now() >= deadline {
                info!(steps_run, "run budget exhausted, pausing");
                return Ok(RunOutcome::Paused {
                    job_id,
                    steps_run,
                    reason: PauseReason::BudgetExhausted,
                });
            }
            if !guard.extend(self.config.lock_ttl).await? {
                return Ok(RunOutcome::Paused {
                    job_id,
                    steps_run,
                    reason: PauseReason::LockLost,
                });
            }

            let ctx = StepContext {
                job_id,
                tenant_id: job.workspace_id,
                source: job.source,
                metadata: job.metadata.clone(),
                outputs: job.result.clone(),
            };
            let result = match tokio::time::timeout(self.config.step_timeout, step.run(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::retryable(format!(
                    "step timed out after {:?}",
                    self.config.step_timeout
                ))),
            };

            match result {
                Ok(output) => {
                    job.record_step(step_id, output, total, self.clock.now());
                    job = self.persist(&job).await?;
                    steps_run += 1;
                    info!(step = step_id, progress = job.progress, "provisioning step completed");
                }
                Err(err) => {
                    let failed = job.record_failure(
                        err.to_string(),
                        err.is_retryable(),
                        self.config.max_step_failures,
                        self.clock.now(),
                    );
                    self.persist(&job).await?;
                    let step = step_id.to_string();
                    let error = err.to_string();
                    return Ok(if failed {
                        warn!(step = %step, %error, "provisioning job failed");
                        RunOutcome::Failed { job_id, step, error }
                    } else {
                        warn!(step = %step, %error, failures = job.step_failures, "provisioning step failed, will retry");
                        RunOutcome::Retrying { job_id, step, error }
                    });
                }
            }
        }

        if !self.pipeline.is_complete(&job.completed_steps) {
            // Unreachable with a fixed pipeline; kept so a job is never
            // marked completed with missing steps.
            return Ok(RunOutcome::Paused {
                job_id,
                steps_run,
                reason: PauseReason::BudgetExhausted,
            });
        }
        job.mark_completed(self.clock.now());
        self.persist(&job).await?;
        info!(steps_run, "provisioning job completed");
        Ok(RunOutcome::Completed { job_id, steps_run })
    }

    async fn persist(&self, job: &ProvisioningJob) -> Result<ProvisioningJob, EngineError> {
        Ok(self
            .store
            .update(job, ExpectedVersion::Exact(job.version))
            .await?)
    }

    /// Active jobs idle longer than `stuck_after`.
    pub async fn list_stuck(&self, limit: usize) -> Result<Vec<ProvisioningJob>, EngineError> {
        let cutoff = self.clock.now() - chrono_duration(self.config.stuck_after);
        Ok(self.store.list_stuck(cutoff, limit).await?)
    }

    pub async fn list_failed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, EngineError> {
        Ok(self.store.list_failed_since(since, limit).await?)
    }

    /// Per-tenant latest job with stuck flag and live lock holder.
    pub async fn health(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<HealthReport, EngineError> {
        let now = self.clock.now();
        let cutoff = now - chrono_duration(self.config.stuck_after);
        let stats = self.store.stats(tenant_id).await?;
        let latest = self.store.latest_per_tenant(tenant_id, limit).await?;

        let mut tenants = Vec::with_capacity(latest.len());
        let mut stuck = 0;
        for job in latest {
            let is_stuck = job.is_active() && job.updated_at < cutoff;
            if is_stuck {
                stuck += 1;
            }
            let lock = self
                .locks
                .inspect(job.workspace_id, ResourceKind::Provisioning)
                .await?;
            tenants.push(TenantHealth {
                tenant_id: job.workspace_id,
                job,
                stuck: is_stuck,
                lock,
            });
        }

        Ok(HealthReport {
            generated_at: now,
            stats,
            stuck,
            tenants,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tenantflow_core::ManualClock;

    use super::*;
    use crate::jobs::pipeline::ProvisioningStep;
    use crate::jobs::{InMemoryJobStore, JobSource, StepOutput};
    use crate::lock::{InMemoryLockStore, LockConfig};

    struct CountingStep {
        id: &'static str,
        runs: AtomicUsize,
    }

    impl CountingStep {
        fn new(id: &'static str) -> Arc<Self> {
            Arc::new(Self {
                id,
                runs: AtomicUsize::new(0),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProvisioningStep for CountingStep {
        fn id(&self) -> &str {
            self.id
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::Custom {
                data: serde_json::json!({ "step": self.id }),
            })
        }
    }

    /// Fails the first `failures` invocations.
    struct FlakyStep {
        failures: AtomicU32,
        permanent: bool,
    }

    #[async_trait]
    impl ProvisioningStep for FlakyStep {
        fn id(&self) -> &str {
            "channel"
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.permanent {
                    StepError::permanent("number unavailable")
                } else {
                    StepError::retryable("carrier timeout")
                });
            }
            Ok(StepOutput::MessagingChannel {
                channel: "sms".into(),
                address: "+15550100".into(),
                external_id: "PN1".into(),
            })
        }
    }

    struct SlowStep(Arc<ManualClock>);

    #[async_trait]
    impl ProvisioningStep for SlowStep {
        fn id(&self) -> &str {
            "slow"
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
            self.0.advance(Duration::from_secs(61));
            Ok(StepOutput::Workflows {
                workflow_ids: vec!["wf-1".into()],
            })
        }
    }

    struct Harness {
        engine: ProvisioningEngine,
        store: Arc<InMemoryJobStore>,
        locks: LockManager,
        clock: Arc<ManualClock>,
    }

    fn harness(steps: Vec<Arc<dyn ProvisioningStep>>, config: ProvisioningConfig) -> Harness {
        harness_with_clock(Arc::new(ManualClock::starting_now()), steps, config)
    }

    fn harness_with_clock(
        clock: Arc<ManualClock>,
        steps: Vec<Arc<dyn ProvisioningStep>>,
        config: ProvisioningConfig,
    ) -> Harness {
        let store = InMemoryJobStore::arc();
        let locks = LockManager::new(
            Arc::new(InMemoryLockStore::new()),
            clock.clone(),
            LockConfig::default(),
        );
        let engine = ProvisioningEngine::new(
            store.clone(),
            locks.clone(),
            Arc::new(Pipeline::new(steps).unwrap()),
            clock.clone(),
            config,
        );
        Harness {
            engine,
            store,
            locks,
            clock,
        }
    }

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_tenant() {
        let h = harness(vec![CountingStep::new("billing")], ProvisioningConfig::default());
        let tenant = test_tenant();

        let first = h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();
        let second = h
            .engine
            .enqueue(
                tenant,
                EnqueueRequest {
                    source: JobSource::Automatic,
                    metadata: serde_json::json!({}),
                },
            )
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn run_executes_every_step_and_completes() {
        let billing = CountingStep::new("billing");
        let workflows = CountingStep::new("workflows");
        let h = harness(
            vec![billing.clone(), workflows.clone()],
            ProvisioningConfig::default(),
        );
        let tenant = test_tenant();
        let job_id = h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap().job_id;

        let outcome = h.engine.run_next().await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { job_id, steps_run: 2 });

        let job = h.engine.status(tenant).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.completed_steps, vec!["billing", "workflows"]);
        assert_eq!(job.result.steps.len(), 2);
        assert!(job.completed_at.is_some());
        assert!(h.locks.inspect(tenant, ResourceKind::Provisioning).await.unwrap().is_none());

        assert_eq!(h.engine.run_next().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn failed_step_resumes_without_rerunning_completed_steps() {
        let billing = CountingStep::new("billing");
        let flaky = Arc::new(FlakyStep {
            failures: AtomicU32::new(1),
            permanent: false,
        });
        let h = harness(vec![billing.clone(), flaky], ProvisioningConfig::default());
        let tenant = test_tenant();
        let job_id = h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap().job_id;

        let outcome = h.engine.run_for_tenant(tenant).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Retrying { ref step, .. } if step == "channel"));
        let job = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.completed_steps, vec!["billing"]);
        assert_eq!(job.progress, 50);
        assert!(job.error.is_some());

        let outcome = h.engine.run_for_tenant(tenant).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { job_id, steps_run: 1 });
        assert_eq!(billing.runs(), 1);
    }

    #[tokio::test]
    async fn permanent_step_failure_fails_the_job() {
        let h = harness(
            vec![Arc::new(FlakyStep {
                failures: AtomicU32::new(1),
                permanent: true,
            })],
            ProvisioningConfig::default(),
        );
        let tenant = test_tenant();
        h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();

        let outcome = h.engine.run_next().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        let job = h.engine.status(tenant).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(h.locks.inspect(tenant, ResourceKind::Provisioning).await.unwrap().is_none());

        // A failed job no longer blocks a fresh enqueue.
        assert!(h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap().created);
    }

    #[tokio::test]
    async fn repeated_retryable_failures_hit_the_threshold() {
        let h = harness(
            vec![Arc::new(FlakyStep {
                failures: AtomicU32::new(10),
                permanent: false,
            })],
            ProvisioningConfig {
                max_step_failures: 2,
                ..Default::default()
            },
        );
        let tenant = test_tenant();
        h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();

        assert!(matches!(h.engine.run_next().await.unwrap(), RunOutcome::Retrying { .. }));
        assert!(matches!(h.engine.run_next().await.unwrap(), RunOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn busy_lock_leaves_the_job_untouched() {
        let billing = CountingStep::new("billing");
        let h = harness(vec![billing.clone()], ProvisioningConfig::default());
        let tenant = test_tenant();
        let job_id = h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap().job_id;

        let held = h
            .locks
            .try_acquire(tenant, ResourceKind::Provisioning)
            .await
            .unwrap()
            .unwrap();

        let outcome = h.engine.run_next().await.unwrap();
        assert_eq!(outcome, RunOutcome::Busy { job_id, tenant_id: tenant });
        let job = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 1);
        assert_eq!(billing.runs(), 0);

        held.release().await.unwrap();
        assert!(matches!(h.engine.run_next().await.unwrap(), RunOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn run_budget_pauses_between_steps() {
        let clock = Arc::new(ManualClock::starting_now());
        let after = CountingStep::new("after");
        let h = harness_with_clock(
            clock.clone(),
            vec![Arc::new(SlowStep(clock)), after.clone()],
            ProvisioningConfig::default(),
        );

        let tenant = test_tenant();
        let job_id = h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap().job_id;

        let outcome = h.engine.run_next().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Paused {
                job_id,
                steps_run: 1,
                reason: PauseReason::BudgetExhausted
            }
        );
        assert_eq!(after.runs(), 0);
        assert_eq!(
            h.store.get(job_id).await.unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    async fn batch_reports_each_outcome() {
        let h = harness(vec![CountingStep::new("billing")], ProvisioningConfig::default());
        let busy_tenant = test_tenant();
        h.engine.enqueue(test_tenant(), EnqueueRequest::default()).await.unwrap();
        h.engine.enqueue(busy_tenant, EnqueueRequest::default()).await.unwrap();
        let _held = h
            .locks
            .try_acquire(busy_tenant, ResourceKind::Provisioning)
            .await
            .unwrap()
            .unwrap();

        let report = h.engine.run_batch(10).await.unwrap();
        assert_eq!(report.picked, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.busy, 1);
    }

    #[tokio::test]
    async fn health_flags_stuck_jobs_and_live_locks() {
        let h = harness(vec![CountingStep::new("billing")], ProvisioningConfig::default());
        let tenant = test_tenant();
        h.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();
        let _held = h
            .locks
            .try_acquire(tenant, ResourceKind::Provisioning)
            .await
            .unwrap()
            .unwrap();

        h.clock.advance(Duration::from_secs(16 * 60));
        // The held lock's 5 minute TTL has passed as well.
        let report = h.engine.health(Some(tenant), 10).await.unwrap();
        assert_eq!(report.stats.pending, 1);
        assert_eq!(report.stuck, 1);
        assert!(report.tenants[0].stuck);
        assert!(report.tenants[0].lock.is_none());
        assert_eq!(h.engine.list_stuck(10).await.unwrap().len(), 1);
    }
}
