//! Per-tenant sliding-window rate limits and budgets.
//!
//! ## Classes
//!
//! | Class | Default cap | Window | Fast path down |
//! |-------|-------------|--------|----------------|
//! | `ai_response` | 100 | 1 h | durable log |
//! | `outbound_message` | 200 | 1 h | durable log |
//! | `provisioning` | 10 | 1 h | durable log |
//! | `operator_trigger` | 30 | 1 h | allow |
//! | anything else | 60 | 1 min | allow |
//!
//! The fast path is an in-process bounded store, Redis, or the usage log
//! itself. When it fails the class decides: `allow` admits the request and
//! logs a warning, `durable` falls back to the persisted usage log and errors
//! only if that fails too. Events admitted by the fast path for a `durable`
//! class are mirrored into the usage log, so the fallback starts from real
//! usage.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use tenantflow_core::{Clock, DomainError, TenantId};

use crate::time::chrono_duration;

pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;
pub mod window;

pub use postgres::PostgresUsageLog;
#[cfg(feature = "redis")]
pub use redis::RedisCounterStore;
pub use store::{CounterKey, CounterStore, InMemoryCounterStore};
pub use window::{SlidingWindow, WindowState};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter storage error: {0}")]
    Storage(String),
}

/// Budgeted resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    AiResponse,
    OutboundMessage,
    Provisioning,
    OperatorTrigger,
    Custom(String),
}

impl ResourceClass {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceClass::AiResponse => "ai_response",
            ResourceClass::OutboundMessage => "outbound_message",
            ResourceClass::Provisioning => "provisioning",
            ResourceClass::OperatorTrigger => "operator_trigger",
            ResourceClass::Custom(name) => name,
        }
    }
}

impl core::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(DomainError::validation("resource class cannot be empty")),
            "ai_response" => Ok(ResourceClass::AiResponse),
            "outbound_message" => Ok(ResourceClass::OutboundMessage),
            "provisioning" => Ok(ResourceClass::Provisioning),
            "operator_trigger" => Ok(ResourceClass::OperatorTrigger),
            other => Ok(ResourceClass::Custom(other.to_string())),
        }
    }
}

/// Behaviour when the fast counter cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    #[default]
    Allow,
    Durable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub window: Duration,
    pub cap: u32,
    #[serde(default)]
    pub on_unavailable: DegradationPolicy,
}

impl ClassPolicy {
    pub const fn new(window: Duration, cap: u32, on_unavailable: DegradationPolicy) -> Self {
        Self {
            window,
            cap,
            on_unavailable,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Policies keyed by class name.
    #[serde(default = "default_classes")]
    pub classes: BTreeMap<String, ClassPolicy>,

    /// Policy for classes with no entry.
    #[serde(default = "default_policy")]
    pub default_policy: ClassPolicy,

    /// Keys kept by the in-process counter store.
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
}

const HOUR: Duration = Duration::from_secs(3600);

fn default_classes() -> BTreeMap<String, ClassPolicy> {
    use DegradationPolicy::{Allow, Durable};
    [
        (ResourceClass::AiResponse, ClassPolicy::new(HOUR, 100, Durable)),
        (ResourceClass::OutboundMessage, ClassPolicy::new(HOUR, 200, Durable)),
        (ResourceClass::Provisioning, ClassPolicy::new(HOUR, 10, Durable)),
        (ResourceClass::OperatorTrigger, ClassPolicy::new(HOUR, 30, Allow)),
    ]
    .into_iter()
    .map(|(class, policy)| (class.as_str().to_string(), policy))
    .collect()
}

const fn default_policy() -> ClassPolicy {
    ClassPolicy::new(Duration::from_secs(60), 60, DegradationPolicy::Allow)
}

const fn default_max_tracked_keys() -> usize {
    InMemoryCounterStore::DEFAULT_CAPACITY
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            classes: default_classes(),
            default_policy: default_policy(),
            max_tracked_keys: default_max_tracked_keys(),
        }
    }
}

impl RateLimitConfig {
    pub fn policy_for(&self, class: &ResourceClass) -> &ClassPolicy {
        self.classes
            .get(class.as_str())
            .unwrap_or(&self.default_policy)
    }

    pub fn with_class(mut self, class: ResourceClass, policy: ClassPolicy) -> Self {
        self.classes.insert(class.as_str().to_string(), policy);
        self
    }
}

/// Result of `check_and_consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// The fast counter was unavailable and the class policy decided.
    pub degraded: bool,
}

/// Consumption of one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassUsage {
    pub class: String,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub window_secs: u64,
    pub reset_at: DateTime<Utc>,
    pub degraded: bool,
}

pub struct RateLimiter {
    fast: Arc<dyn CounterStore>,
    durable: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        fast: Arc<dyn CounterStore>,
        durable: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            fast,
            durable,
            clock,
            config,
        }
    }

    /// In-memory fast path, no durable fallback.
    pub fn in_memory(clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        let fast = Arc::new(InMemoryCounterStore::new(config.max_tracked_keys));
        Self::new(fast, None, clock, config)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one unit of `class` for the tenant if under the cap.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, class = %class), err)]
    pub async fn check_and_consume(
        &self,
        tenant_id: TenantId,
        class: ResourceClass,
    ) -> Result<RateDecision, RateLimitError> {
        let policy = self.config.policy_for(&class).clone();
        let key = CounterKey::new(tenant_id, class);
        let now = self.clock.now();
        let window = chrono_duration(policy.window);

        let (state, degraded) = match self.fast.try_consume(&key, window, policy.cap, now).await {
            Ok(state) => {
                if state.allowed {
                    self.mirror(&key, &policy, window, now).await;
                }
                (state, false)
            }
            Err(e) => match self.degrade(&key, &policy, &e) {
                Fallback::Allow => {
                    return Ok(RateDecision {
                        allowed: true,
                        limit: policy.cap,
                        remaining: policy.cap,
                        reset_at: now + window,
                        degraded: true,
                    });
                }
                Fallback::Durable(durable) => {
                    (durable.try_consume(&key, window, policy.cap, now).await?, true)
                }
                Fallback::Fail => return Err(e),
            },
        };

        if !state.allowed {
            debug!(%key, count = state.count, cap = policy.cap, "rate limit reached");
        }
        Ok(RateDecision {
            allowed: state.allowed,
            limit: policy.cap,
            remaining: state.remaining(policy.cap),
            reset_at: state.reset_at,
            degraded,
        })
    }

    /// Usage of every configured class for the tenant.
    pub async fn get_stats(&self, tenant_id: TenantId) -> Result<Vec<ClassUsage>, RateLimitError> {
        let now = self.clock.now();
        let mut usage = Vec::with_capacity(self.config.classes.len());

        for (name, policy) in &self.config.classes {
            let class = ResourceClass::from_str(name)
                .map_err(|e| RateLimitError::Storage(e.to_string()))?;
            let key = CounterKey::new(tenant_id, class);
            let window = chrono_duration(policy.window);

            let (state, degraded) = match self.fast.peek(&key, window, policy.cap, now).await {
                Ok(state) => (state, false),
                Err(e) => match self.degrade(&key, policy, &e) {
                    Fallback::Durable(durable) => {
                        (durable.peek(&key, window, policy.cap, now).await?, true)
                    }
                    Fallback::Allow => (
                        WindowState {
                            allowed: true,
                            count: 0,
                            reset_at: now + window,
                        },
                        true,
                    ),
                    Fallback::Fail => return Err(e),
                },
            };

            usage.push(ClassUsage {
                class: name.clone(),
                limit: policy.cap,
                used: state.count,
                remaining: state.remaining(policy.cap),
                window_secs: policy.window.as_secs(),
                reset_at: state.reset_at,
                degraded,
            });
        }
        Ok(usage)
    }

    /// Forget the tenant's usage of `class` in every store.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, class = %class), err)]
    pub async fn reset(&self, tenant_id: TenantId, class: ResourceClass) -> Result<(), RateLimitError> {
        let key = CounterKey::new(tenant_id, class);
        self.fast.reset(&key).await?;
        if let Some(durable) = &self.durable {
            durable.reset(&key).await?;
        }
        Ok(())
    }

    async fn mirror(
        &self,
        key: &CounterKey,
        policy: &ClassPolicy,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        if policy.on_unavailable != DegradationPolicy::Durable {
            return;
        }
        if let Some(durable) = &self.durable {
            // Best effort: the fast counter has already admitted the event.
            if let Err(e) = durable.record(key, window, now).await {
                warn!(%key, error = %e, "failed to mirror usage into the durable log");
            }
        }
    }

    fn degrade(&self, key: &CounterKey, policy: &ClassPolicy, err: &RateLimitError) -> Fallback<'_> {
        match policy.on_unavailable {
            DegradationPolicy::Allow => {
                warn!(%key, error = %err, "rate limit counter unavailable, allowing");
                Fallback::Allow
            }
            DegradationPolicy::Durable => match &self.durable {
                Some(durable) => {
                    warn!(%key, error = %err, "rate limit counter unavailable, using durable log");
                    Fallback::Durable(durable)
                }
                None => Fallback::Fail,
            },
        }
    }
}

enum Fallback<'a> {
    Allow,
    Durable(&'a Arc<dyn CounterStore>),
    Fail,
}
