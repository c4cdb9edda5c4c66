//! Service wiring: stores, locks, engine, limiter, dispatcher and operator.
//!
//! In-memory by default. With `USE_PERSISTENT_STORES=true` every ledger moves
//! to Postgres; with the `redis` feature and `REDIS_URL`, locks and fast
//! counters move to Redis.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use tenantflow_core::{Clock, SystemClock};
use tenantflow_infra::Settings;
use tenantflow_infra::idempotency::{
    IdempotencyGuard, InMemoryWebhookEventStore, PostgresWebhookEventStore, WebhookEventStore,
};
use tenantflow_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore, ProvisioningEngine};
use tenantflow_infra::lock::{InMemoryLockStore, LockManager, LockStore, PostgresLockStore};
use tenantflow_infra::operator::{
    ActionExecutor, FollowUpSource, InMemoryFollowUps, LoggingFollowUpSender, OperatorRuntime,
    SignalCollector, TracingNotifier,
};
use tenantflow_infra::postgres::apply_schema;
use tenantflow_infra::rate_limit::{
    CounterStore, InMemoryCounterStore, PostgresUsageLog, RateLimiter,
};
use tenantflow_infra::webhooks::{
    InMemoryTenantResolver, PostgresTenantDirectory, TenantDirectory, TenantResolver,
    WebhookDispatcher, WebhookHandlers,
};

#[cfg(feature = "redis")]
use tenantflow_infra::{lock::RedisLockStore, rate_limit::RedisCounterStore};

use super::steps;

/// Everything the handlers and schedulers need.
pub struct AppServices {
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    pub locks: LockManager,
    pub engine: Arc<ProvisioningEngine>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: WebhookDispatcher,
    pub operator: OperatorRuntime,
    pub directory: Arc<dyn TenantDirectory>,
    pub follow_ups: Arc<InMemoryFollowUps>,
}

/// Backends chosen for one process.
struct Backends {
    events: Arc<dyn WebhookEventStore>,
    locks: Arc<dyn LockStore>,
    jobs: Arc<dyn JobStore>,
    fast_counters: Arc<dyn CounterStore>,
    durable_counters: Option<Arc<dyn CounterStore>>,
    directory: Arc<dyn TenantDirectory>,
}

pub async fn build_services(settings: Settings) -> anyhow::Result<AppServices> {
    let backends = if settings.storage.persistent {
        persistent_backends(&settings).await?
    } else {
        in_memory_backends(&settings)
    };
    assemble(settings, backends, Arc::new(SystemClock))
}

/// In-memory wiring with an injected clock. Used by tests.
pub fn build_in_memory_services(
    settings: Settings,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<AppServices> {
    let backends = in_memory_backends(&settings);
    assemble(settings, backends, clock)
}

fn in_memory_backends(settings: &Settings) -> Backends {
    Backends {
        events: Arc::new(InMemoryWebhookEventStore::new()),
        locks: Arc::new(InMemoryLockStore::new()),
        jobs: InMemoryJobStore::arc(),
        fast_counters: Arc::new(InMemoryCounterStore::new(settings.rate_limit.max_tracked_keys)),
        durable_counters: None,
        directory: Arc::new(InMemoryTenantResolver::new()),
    }
}

async fn persistent_backends(settings: &Settings) -> anyhow::Result<Backends> {
    let database_url = settings
        .storage
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    apply_schema(&pool).await.context("failed to apply schema")?;

    let usage_log: Arc<dyn CounterStore> = Arc::new(PostgresUsageLog::new(pool.clone()));

    // Without Redis the usage log is the only counter shared between
    // processes, so it serves the fast path too.
    let (locks, fast_counters, durable_counters) = match redis_backends(settings)? {
        Some((locks, counters)) => (locks, counters, Some(usage_log)),
        None => (
            Arc::new(PostgresLockStore::new(pool.clone())) as Arc<dyn LockStore>,
            usage_log,
            None,
        ),
    };

    Ok(Backends {
        events: Arc::new(PostgresWebhookEventStore::new(pool.clone())),
        locks,
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        fast_counters,
        durable_counters,
        directory: Arc::new(PostgresTenantDirectory::new(pool)),
    })
}

#[cfg(feature = "redis")]
fn redis_backends(
    settings: &Settings,
) -> anyhow::Result<Option<(Arc<dyn LockStore>, Arc<dyn CounterStore>)>> {
    let Some(redis_url) = settings.storage.redis_url.as_deref() else {
        return Ok(None);
    };
    let locks = RedisLockStore::new(redis_url).context("failed to open Redis lock store")?;
    let counters = RedisCounterStore::new(redis_url).context("failed to open Redis counters")?;
    tracing::info!("locks and rate counters backed by Redis");
    Ok(Some((Arc::new(locks), Arc::new(counters))))
}

#[cfg(not(feature = "redis"))]
fn redis_backends(
    settings: &Settings,
) -> anyhow::Result<Option<(Arc<dyn LockStore>, Arc<dyn CounterStore>)>> {
    if settings.storage.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but redis feature not enabled, using Postgres locks");
    }
    Ok(None)
}

fn assemble(
    settings: Settings,
    backends: Backends,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<AppServices> {
    let locks = LockManager::new(backends.locks, clock.clone(), settings.lock.clone());

    let engine = Arc::new(ProvisioningEngine::new(
        backends.jobs,
        locks.clone(),
        Arc::new(steps::default_pipeline().context("invalid provisioning pipeline")?),
        clock.clone(),
        settings.provisioning.clone(),
    ));

    let limiter = Arc::new(RateLimiter::new(
        backends.fast_counters,
        backends.durable_counters,
        clock.clone(),
        settings.rate_limit.clone(),
    ));

    let guard = Arc::new(IdempotencyGuard::new(
        backends.events.clone(),
        clock.clone(),
        settings.idempotency.clone(),
    ));
    let resolver: Arc<dyn TenantResolver> = Arc::new(backends.directory.clone());
    let dispatcher = WebhookDispatcher::new(
        guard,
        resolver,
        WebhookHandlers::with_provisioning(engine.clone()),
        settings.webhooks.clone(),
        clock.clone(),
    );

    let follow_ups = Arc::new(InMemoryFollowUps::new());
    let follow_up_source: Arc<dyn FollowUpSource> = follow_ups.clone();
    let collector = SignalCollector::new(
        engine.clone(),
        locks.clone(),
        backends.events,
        follow_up_source.clone(),
        clock.clone(),
    );
    let executor = ActionExecutor::new(
        engine.clone(),
        locks.clone(),
        limiter.clone(),
        follow_up_source,
        Arc::new(LoggingFollowUpSender),
        Arc::new(TracingNotifier),
    );
    let operator = OperatorRuntime::new(collector, executor, clock.clone(), settings.operator.clone());

    Ok(AppServices {
        settings,
        clock,
        locks,
        engine,
        limiter,
        dispatcher,
        operator,
        directory: backends.directory,
        follow_ups,
    })
}
