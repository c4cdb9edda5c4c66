//! Infrastructure layer: tenant-scoped orchestration over Postgres, Redis and
//! in-process stores.
//!
//! - `idempotency`: exactly-once claim/complete/fail for inbound events
//! - `lock`: TTL-bounded per-tenant mutual exclusion
//! - `webhooks`: verify, resolve, dedupe and route provider callbacks
//! - `jobs`: resumable provisioning pipelines
//! - `rate_limit`: per-tenant sliding-window budgets
//! - `operator`: periodic signal sweep and bounded remediation

pub mod config;
pub mod idempotency;
pub mod jobs;
pub mod lock;
pub mod operator;
pub mod postgres;
pub mod rate_limit;
pub mod retry;
pub mod time;
pub mod webhooks;

pub use config::{ConfigError, SchedulerConfig, Settings, StorageConfig};
