use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use tenantflow_core::Clock;

use super::actions::{ActionExecutor, ActionOutcome};
use super::policy;
use super::signals::SignalCollector;
use super::{OperatorConfig, RunParams, SweepReport};
use crate::time::chrono_duration;

/// Scheduled sweep: signals → policy → bounded actions.
pub struct OperatorRuntime {
    collector: SignalCollector,
    executor: ActionExecutor,
    clock: Arc<dyn Clock>,
    config: OperatorConfig,
    last_trigger: Mutex<Option<DateTime<Utc>>>,
}

impl OperatorRuntime {
    pub fn new(
        collector: SignalCollector,
        executor: ActionExecutor,
        clock: Arc<dyn Clock>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            collector,
            executor,
            clock,
            config,
            last_trigger: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn default_params(&self) -> RunParams {
        RunParams {
            max_signals: self.config.max_signals,
            max_actions: self.config.max_actions,
        }
    }

    /// One sweep. Actions run sequentially; a failing action is counted and
    /// the sweep moves on.
    #[instrument(skip(self), fields(max_signals = params.max_signals, max_actions = params.max_actions))]
    pub async fn run(&self, params: RunParams) -> SweepReport {
        let started = Instant::now();
        let batch = self.collector.collect(&self.config, params.max_signals).await;
        let plan = policy::evaluate(&batch.signals, params.max_actions);

        let mut report = SweepReport {
            signals_seen: batch.signals.len(),
            actions_planned: plan.len(),
            signal_errors: batch.source_errors,
            ..SweepReport::default()
        };

        for candidate in &plan {
            match self.executor.execute(candidate).await {
                ActionOutcome::Taken => report.actions_taken += 1,
                ActionOutcome::NoOp => report.already_resolved += 1,
                ActionOutcome::SkippedBudget => report.skipped_budget += 1,
                ActionOutcome::SkippedLock => report.skipped_lock += 1,
                ActionOutcome::Failed(_) => report.failed += 1,
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            signals = report.signals_seen,
            planned = report.actions_planned,
            taken = report.actions_taken,
            already_resolved = report.already_resolved,
            skipped_budget = report.skipped_budget,
            skipped_lock = report.skipped_lock,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "operator sweep finished"
        );
        report
    }

    /// Sweep with default caps unless another trigger ran within
    /// `trigger_min_interval`, in which case nothing runs.
    pub async fn trigger_opportunistic(&self) -> Option<SweepReport> {
        let now = self.clock.now();
        {
            let mut last = self
                .last_trigger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let min_interval = chrono_duration(self.config.trigger_min_interval);
            if last.is_some_and(|at| now - at < min_interval) {
                debug!("opportunistic trigger debounced");
                return None;
            }
            *last = Some(now);
        }
        Some(self.run(self.default_params()).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tenantflow_core::{ManualClock, TenantId};
    use tokio::sync::Notify;

    use super::*;
    use crate::idempotency::InMemoryWebhookEventStore;
    use crate::jobs::{
        EnqueueRequest, InMemoryJobStore, JobStatus, Pipeline, ProvisioningConfig,
        ProvisioningEngine, ProvisioningStep, StaticStep, StepContext, StepError, StepOutput,
    };
    use crate::lock::{InMemoryLockStore, LockConfig, LockManager, ResourceKind};
    use crate::operator::actions::{Escalation, FollowUpSender, Notifier};
    use crate::operator::signals::{FollowUp, InMemoryFollowUps};
    use crate::operator::OperatorError;
    use crate::operator::policy::{Action, CandidateAction, Priority};
    use crate::rate_limit::{ClassPolicy, DegradationPolicy, RateLimitConfig, RateLimiter, ResourceClass};

    /// Blocks until released so a second sweep can observe the held lock.
    struct GateStep {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ProvisioningStep for GateStep {
        fn id(&self) -> &str {
            "gate"
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(StepOutput::Custom {
                data: serde_json::Value::Null,
            })
        }
    }

    #[derive(Default)]
    struct CountingSender(AtomicUsize);

    #[async_trait]
    impl FollowUpSender for CountingSender {
        async fn send(&self, _follow_up: &FollowUp) -> Result<(), OperatorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<Escalation>>);

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, escalation: &Escalation) -> Result<(), OperatorError> {
            self.0.lock().unwrap().push(escalation.clone());
            Ok(())
        }
    }

    struct Fixture {
        runtime: Arc<OperatorRuntime>,
        engine: Arc<ProvisioningEngine>,
        locks: LockManager,
        follow_ups: Arc<InMemoryFollowUps>,
        sender: Arc<CountingSender>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    fn fixture(steps: Vec<Arc<dyn ProvisioningStep>>, rate_limits: RateLimitConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let locks = LockManager::new(
            Arc::new(InMemoryLockStore::new()),
            clock.clone(),
            LockConfig::default(),
        );
        let engine = Arc::new(ProvisioningEngine::new(
            InMemoryJobStore::arc(),
            locks.clone(),
            Arc::new(Pipeline::new(steps).unwrap()),
            clock.clone(),
            ProvisioningConfig {
                stuck_after: Duration::from_secs(1),
                ..ProvisioningConfig::default()
            },
        ));
        let limiter = Arc::new(RateLimiter::in_memory(clock.clone(), rate_limits));
        let follow_ups = Arc::new(InMemoryFollowUps::new());
        let sender = Arc::new(CountingSender::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let collector = SignalCollector::new(
            engine.clone(),
            locks.clone(),
            Arc::new(InMemoryWebhookEventStore::new()),
            follow_ups.clone(),
            clock.clone(),
        );
        let executor = ActionExecutor::new(
            engine.clone(),
            locks.clone(),
            limiter,
            follow_ups.clone(),
            sender.clone(),
            notifier.clone(),
        );
        let runtime = Arc::new(OperatorRuntime::new(
            collector,
            executor,
            clock.clone(),
            OperatorConfig::default(),
        ));

        Fixture {
            runtime,
            engine,
            locks,
            follow_ups,
            sender,
            notifier,
            clock,
        }
    }

    fn static_steps() -> Vec<Arc<dyn ProvisioningStep>> {
        vec![Arc::new(StaticStep::new(
            "billing",
            StepOutput::Custom {
                data: serde_json::Value::Null,
            },
        ))]
    }

    fn params() -> RunParams {
        RunParams {
            max_signals: 50,
            max_actions: 10,
        }
    }

    #[tokio::test]
    async fn resumes_stuck_jobs() {
        let f = fixture(static_steps(), RateLimitConfig::default());
        let tenant = TenantId::new();
        f.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();
        f.clock.advance(Duration::from_secs(5));

        let report = f.runtime.run(params()).await;
        assert_eq!(report.signals_seen, 1);
        assert_eq!(report.actions_taken, 1);

        let job = f.engine.status(tenant).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_sweeps_only_one_holds_the_provisioning_lock() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate: Arc<dyn ProvisioningStep> = Arc::new(GateStep {
            entered: entered.clone(),
            release: release.clone(),
        });
        let f = fixture(vec![gate], RateLimitConfig::default());
        let tenant = TenantId::new();
        f.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();
        f.clock.advance(Duration::from_secs(2));

        let first = {
            let runtime = f.runtime.clone();
            tokio::spawn(async move { runtime.run(params()).await })
        };
        entered.notified().await;
        assert!(f
            .locks
            .inspect(tenant, ResourceKind::Provisioning)
            .await
            .unwrap()
            .is_some());

        // The job still looks stuck to the second sweep.
        f.clock.advance(Duration::from_secs(2));
        let second = f.runtime.run(params()).await;
        assert_eq!(second.actions_planned, 1);
        assert_eq!(second.skipped_lock, 1);
        assert_eq!(second.actions_taken, 0);

        release.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.actions_taken, 1);
        assert_eq!(
            f.engine.status(tenant).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn follow_ups_are_sent_once_within_budget() {
        let limits = RateLimitConfig::default().with_class(
            ResourceClass::OutboundMessage,
            ClassPolicy::new(Duration::from_secs(3600), 1, DegradationPolicy::Allow),
        );
        let f = fixture(static_steps(), limits);
        let tenant = TenantId::new();
        let now = f.clock.now();
        for id in ["f1", "f2"] {
            f.follow_ups.schedule(FollowUp {
                id: id.into(),
                tenant_id: tenant,
                conversation_id: "conv-1".into(),
                due_at: now,
                context: serde_json::Value::Null,
            });
        }

        // Both follow-ups dedup to one action per tenant per sweep.
        let report = f.runtime.run(params()).await;
        assert_eq!(report.signals_seen, 2);
        assert_eq!(report.actions_planned, 1);
        assert_eq!(report.actions_taken, 1);

        let report = f.runtime.run(params()).await;
        assert_eq!(report.skipped_budget, 1);
        assert_eq!(f.sender.0.load(Ordering::SeqCst), 1);
        assert_eq!(f.follow_ups.pending_count(), 1);
        assert_eq!(f.locks.held_count(), 0);
    }

    #[tokio::test]
    async fn caps_bound_the_sweep() {
        let f = fixture(static_steps(), RateLimitConfig::default());
        for _ in 0..5 {
            f.engine
                .enqueue(TenantId::new(), EnqueueRequest::default())
                .await
                .unwrap();
        }
        f.clock.advance(Duration::from_secs(5));

        let report = f
            .runtime
            .run(RunParams {
                max_signals: 3,
                max_actions: 2,
            })
            .await;
        assert_eq!(report.signals_seen, 3);
        assert_eq!(report.actions_planned, 2);
        assert_eq!(report.actions_taken, 2);
    }

    #[tokio::test]
    async fn failed_jobs_escalate() {
        struct Broken;

        #[async_trait]
        impl ProvisioningStep for Broken {
            fn id(&self) -> &str {
                "billing"
            }

            async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
                Err(StepError::permanent("card declined"))
            }
        }

        let f = fixture(vec![Arc::new(Broken)], RateLimitConfig::default());
        let tenant = TenantId::new();
        f.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();
        f.engine.run_for_tenant(tenant).await.unwrap();

        let report = f.runtime.run(params()).await;
        assert_eq!(report.actions_taken, 1);
        let escalations = f.notifier.0.lock().unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].tenant_id, tenant);
        assert!(escalations[0].reason.contains("card declined"));
    }

    #[tokio::test]
    async fn resuming_a_finished_job_is_not_counted_as_taken() {
        let f = fixture(static_steps(), RateLimitConfig::default());
        let tenant = TenantId::new();
        f.engine.enqueue(tenant, EnqueueRequest::default()).await.unwrap();
        f.engine.run_for_tenant(tenant).await.unwrap();

        let executor = ActionExecutor::new(
            f.engine.clone(),
            f.locks.clone(),
            Arc::new(RateLimiter::in_memory(f.clock.clone(), RateLimitConfig::default())),
            f.follow_ups.clone(),
            f.sender.clone(),
            f.notifier.clone(),
        );
        let resume = CandidateAction {
            action: Action::ResumeProvisioning {
                tenant_id: tenant,
                job_id: tenantflow_core::JobId::new(),
            },
            priority: Priority::High,
        };
        assert_eq!(executor.execute(&resume).await, ActionOutcome::NoOp);
    }

    #[tokio::test]
    async fn trigger_survives_a_poisoned_debounce_lock() {
        let f = fixture(static_steps(), RateLimitConfig::default());
        let runtime = f.runtime.clone();
        let _ = std::thread::spawn(move || {
            let _held = runtime.last_trigger.lock().unwrap();
            panic!("poison the debounce lock");
        })
        .join();
        assert!(f.runtime.last_trigger.is_poisoned());

        assert!(f.runtime.trigger_opportunistic().await.is_some());
        assert!(f.runtime.trigger_opportunistic().await.is_none());
    }

    #[tokio::test]
    async fn opportunistic_trigger_is_debounced() {
        let f = fixture(static_steps(), RateLimitConfig::default());
        assert!(f.runtime.trigger_opportunistic().await.is_some());
        assert!(f.runtime.trigger_opportunistic().await.is_none());

        f.clock.advance(f.runtime.config().trigger_min_interval);
        assert!(f.runtime.trigger_opportunistic().await.is_some());
    }
}
