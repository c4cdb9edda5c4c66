//! Periodic provisioning batches and operator sweeps.
//!
//! Each loop ticks on a fixed interval until cancelled. Overlap with manual
//! triggers or other replicas is safe: jobs and actions go through tenant
//! locks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::services::AppServices;

/// Spawn both loops. Returns no handles when scheduling is disabled.
pub fn spawn(services: Arc<AppServices>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let config = services.settings.scheduler.clone();
    if !config.enabled {
        tracing::info!("scheduler disabled");
        return Vec::new();
    }

    vec![
        tokio::spawn(run_provisioning(services.clone(), config.job_interval, cancel.clone())),
        tokio::spawn(run_operator(services, config.operator_interval, cancel)),
    ]
}

async fn run_provisioning(
    services: Arc<AppServices>,
    every: std::time::Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = every.as_secs(), "provisioning scheduler started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let batch_size = services.engine.config().batch_size;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("provisioning scheduler stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = services.engine.run_batch(batch_size).await {
                    tracing::error!(error = %e, "provisioning batch failed");
                }
            }
        }
    }
}

async fn run_operator(
    services: Arc<AppServices>,
    every: std::time::Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = every.as_secs(), "operator scheduler started");
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("operator scheduler stopping");
                break;
            }
            _ = interval.tick() => {
                services.operator.run(services.operator.default_params()).await;
            }
        }
    }
}
