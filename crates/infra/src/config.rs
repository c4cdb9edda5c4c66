//! Runtime configuration.
//!
//! Every section has serde defaults, so a bare environment yields a working
//! in-memory setup. `Settings::from_env` reads:
//!
//! | Env Var | Default |
//! |---------|---------|
//! | `TENANTFLOW_BIND_ADDR` | `0.0.0.0:8080` |
//! | `TENANTFLOW_ADMIN_TOKEN` | unset (admin routes refuse everything) |
//! | `TENANTFLOW_PUBLIC_BASE_URL` | unset (Twilio URL taken from the request) |
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `REDIS_URL` | unset (feature `redis`) |
//! | `TENANTFLOW_IDEMPOTENCY_MAX_ATTEMPTS` | `3` |
//! | `TENANTFLOW_PROCESSING_TIMEOUT_SECS` | `300` |
//! | `TENANTFLOW_LOCK_TTL_SECS` | `300` |
//! | `TENANTFLOW_JOB_RUN_BUDGET_SECS` | `60` |
//! | `TENANTFLOW_JOB_STEP_TIMEOUT_SECS` | `30` |
//! | `TENANTFLOW_JOB_MAX_STEP_FAILURES` | `5` |
//! | `TENANTFLOW_JOB_STUCK_AFTER_SECS` | `900` |
//! | `TENANTFLOW_JOB_BATCH_SIZE` | `5` |
//! | `TENANTFLOW_RATE_LIMITS` | built-in classes (JSON overrides) |
//! | `TENANTFLOW_RATE_LIMIT_MAX_KEYS` | `10000` |
//! | `TENANTFLOW_OPERATOR_MAX_SIGNALS` | `200` |
//! | `TENANTFLOW_OPERATOR_MAX_ACTIONS` | `20` |
//! | `TENANTFLOW_OPERATOR_TRIGGER_MIN_INTERVAL_SECS` | `60` |
//! | `TENANTFLOW_OPERATOR_WEBHOOK_FAILURE_THRESHOLD` | `5` |
//! | `TENANTFLOW_SCHEDULER_ENABLED` | `true` |
//! | `TENANTFLOW_JOB_INTERVAL_SECS` | `30` |
//! | `TENANTFLOW_OPERATOR_INTERVAL_SECS` | `300` |
//! | `STRIPE_WEBHOOK_SECRET` / `TWILIO_AUTH_TOKEN` / `WHATSAPP_APP_SECRET` / `EMAIL_WEBHOOK_SECRET` | unset |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::idempotency::IdempotencyConfig;
use crate::jobs::ProvisioningConfig;
use crate::lock::LockConfig;
use crate::operator::OperatorConfig;
use crate::rate_limit::{ClassPolicy, DegradationPolicy, RateLimitConfig};
use crate::webhooks::WebhookSecrets;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has invalid value `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Periodic background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Provisioning batch tick.
    #[serde(default = "default_job_interval")]
    pub job_interval: Duration,
    /// Operator sweep tick.
    #[serde(default = "default_operator_interval")]
    pub operator_interval: Duration,
}

const fn default_true() -> bool {
    true
}

const fn default_job_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_operator_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            job_interval: default_job_interval(),
            operator_interval: default_operator_interval(),
        }
    }
}

/// Which backends to wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub public_base_url: Option<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhooks: WebhookSecrets,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
            public_base_url: None,
            storage: StorageConfig::default(),
            idempotency: IdempotencyConfig::default(),
            lock: LockConfig::default(),
            provisioning: ProvisioningConfig::default(),
            rate_limit: RateLimitConfig::default(),
            operator: OperatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            webhooks: WebhookSecrets::default(),
        }
    }
}

/// Per-class override as written in `TENANTFLOW_RATE_LIMITS`, e.g.
/// `{"ai_response": {"cap": 50, "window_secs": 3600, "on_unavailable": "durable"}}`.
#[derive(Debug, Deserialize)]
struct ClassOverride {
    cap: u32,
    window_secs: u64,
    #[serde(default)]
    on_unavailable: DegradationPolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let mut s = Settings::default();

        if let Some(addr) = env.string("TENANTFLOW_BIND_ADDR") {
            s.bind_addr = addr;
        }
        s.admin_token = env.string("TENANTFLOW_ADMIN_TOKEN");
        s.public_base_url = env
            .string("TENANTFLOW_PUBLIC_BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string());

        s.storage.persistent = env.parse("USE_PERSISTENT_STORES")?.unwrap_or(false);
        s.storage.database_url = env.string("DATABASE_URL");
        s.storage.redis_url = env.string("REDIS_URL");
        if s.storage.persistent && s.storage.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        if let Some(v) = env.parse("TENANTFLOW_IDEMPOTENCY_MAX_ATTEMPTS")? {
            s.idempotency.max_attempts = v;
        }
        if let Some(v) = env.secs("TENANTFLOW_PROCESSING_TIMEOUT_SECS")? {
            s.idempotency.processing_timeout = v;
        }

        if let Some(v) = env.secs("TENANTFLOW_LOCK_TTL_SECS")? {
            s.lock.default_ttl = v;
            s.provisioning.lock_ttl = v;
        }

        if let Some(v) = env.secs("TENANTFLOW_JOB_RUN_BUDGET_SECS")? {
            s.provisioning.run_budget = v;
        }
        if let Some(v) = env.secs("TENANTFLOW_JOB_STEP_TIMEOUT_SECS")? {
            s.provisioning.step_timeout = v;
        }
        if let Some(v) = env.parse("TENANTFLOW_JOB_MAX_STEP_FAILURES")? {
            s.provisioning.max_step_failures = v;
        }
        if let Some(v) = env.secs("TENANTFLOW_JOB_STUCK_AFTER_SECS")? {
            s.provisioning.stuck_after = v;
        }
        if let Some(v) = env.parse("TENANTFLOW_JOB_BATCH_SIZE")? {
            s.provisioning.batch_size = v;
        }

        if let Some(raw) = env.string("TENANTFLOW_RATE_LIMITS") {
            let overrides: BTreeMap<String, ClassOverride> =
                serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                    name: "TENANTFLOW_RATE_LIMITS",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
            for (class, o) in overrides {
                s.rate_limit.classes.insert(
                    class,
                    ClassPolicy::new(Duration::from_secs(o.window_secs), o.cap, o.on_unavailable),
                );
            }
        }
        if let Some(v) = env.parse("TENANTFLOW_RATE_LIMIT_MAX_KEYS")? {
            s.rate_limit.max_tracked_keys = v;
        }

        if let Some(v) = env.parse("TENANTFLOW_OPERATOR_MAX_SIGNALS")? {
            s.operator.max_signals = v;
        }
        if let Some(v) = env.parse("TENANTFLOW_OPERATOR_MAX_ACTIONS")? {
            s.operator.max_actions = v;
        }
        if let Some(v) = env.secs("TENANTFLOW_OPERATOR_TRIGGER_MIN_INTERVAL_SECS")? {
            s.operator.trigger_min_interval = v;
        }
        if let Some(v) = env.parse("TENANTFLOW_OPERATOR_WEBHOOK_FAILURE_THRESHOLD")? {
            s.operator.webhook_failure_threshold = v;
        }

        if let Some(v) = env.parse("TENANTFLOW_SCHEDULER_ENABLED")? {
            s.scheduler.enabled = v;
        }
        if let Some(v) = env.secs("TENANTFLOW_JOB_INTERVAL_SECS")? {
            s.scheduler.job_interval = v;
        }
        if let Some(v) = env.secs("TENANTFLOW_OPERATOR_INTERVAL_SECS")? {
            s.scheduler.operator_interval = v;
        }

        s.webhooks.stripe = env.string("STRIPE_WEBHOOK_SECRET");
        s.webhooks.twilio = env.string("TWILIO_AUTH_TOKEN");
        s.webhooks.whatsapp = env.string("WHATSAPP_APP_SECRET");
        s.webhooks.email = env.string("EMAIL_WEBHOOK_SECRET");

        Ok(s)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn secs(&self, name: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(settings(&[]).unwrap(), Settings::default());
    }

    #[test]
    fn overrides_are_applied() {
        let s = settings(&[
            ("TENANTFLOW_LOCK_TTL_SECS", "120"),
            ("TENANTFLOW_OPERATOR_MAX_ACTIONS", "7"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_1"),
            ("TENANTFLOW_PUBLIC_BASE_URL", "https://hooks.example.com/"),
            (
                "TENANTFLOW_RATE_LIMITS",
                r#"{"ai_response": {"cap": 5, "window_secs": 60}}"#,
            ),
        ])
        .unwrap();

        assert_eq!(s.lock.default_ttl, Duration::from_secs(120));
        assert_eq!(s.provisioning.lock_ttl, Duration::from_secs(120));
        assert_eq!(s.operator.max_actions, 7);
        assert_eq!(s.webhooks.stripe.as_deref(), Some("whsec_1"));
        assert_eq!(s.public_base_url.as_deref(), Some("https://hooks.example.com"));
        let ai = &s.rate_limit.classes["ai_response"];
        assert_eq!(ai.cap, 5);
        assert_eq!(ai.on_unavailable, DegradationPolicy::Allow);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = settings(&[("TENANTFLOW_JOB_BATCH_SIZE", "many")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "TENANTFLOW_JOB_BATCH_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn persistent_stores_need_a_database() {
        assert_eq!(
            settings(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }
}
