//! HTTP adapter over the orchestration layer: provider webhooks, provisioning
//! jobs, tenant health and budgets, and operator sweeps.

pub mod app;
pub mod middleware;
