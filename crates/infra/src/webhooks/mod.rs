//! Inbound provider webhooks.
//!
//! ## Pipeline
//!
//! verify signature → parse → resolve tenant → idempotent handler run
//!
//! - Verification fails closed; nothing is recorded for a rejected delivery
//! - An event no tenant owns is acknowledged and dropped
//! - Handlers run through `IdempotencyGuard`, at most once per
//!   `(provider, external_id)`
//!
//! ## Components
//!
//! - `signature`: per-provider verification
//! - `providers`: payload parsing
//! - `resolver`: `TenantResolver` collaborator and the `TenantDirectory`
//!   that records lookups (`postgres` holds the durable one)
//! - `handlers`: `WebhookHandlers` and the bundled handlers
//! - `dispatcher`: `WebhookDispatcher` and the `DeliveryAck` decision

use std::time::Duration;

use serde::{Deserialize, Serialize};

use tenantflow_events::Provider;

pub mod dispatcher;
pub mod handlers;
pub mod postgres;
pub mod providers;
pub mod resolver;
pub mod signature;

pub use dispatcher::{DeliveryAck, DispatchError, DispatchOutcome, RejectReason, WebhookDispatcher};
pub use handlers::{AcknowledgeHandler, ProvisioningTriggerHandler, WebhookHandlers};
pub use providers::{MalformedPayload, Parsed, ParsedEvent};
pub use postgres::PostgresTenantDirectory;
pub use resolver::{
    InMemoryTenantResolver, ResolveError, TenantDirectory, TenantLookup, TenantResolver,
};
pub use signature::SignatureError;

/// Per-provider verification secrets. A provider without a secret rejects
/// every delivery.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSecrets {
    /// Stripe endpoint signing secret (`whsec_...`).
    #[serde(default)]
    pub stripe: Option<String>,
    /// Twilio auth token.
    #[serde(default)]
    pub twilio: Option<String>,
    /// Meta app secret.
    #[serde(default)]
    pub whatsapp: Option<String>,
    /// Shared secret expected in `X-Webhook-Secret`.
    #[serde(default)]
    pub email: Option<String>,
    /// Accepted clock skew for Stripe signature timestamps.
    #[serde(default = "default_stripe_tolerance")]
    pub stripe_tolerance: Duration,
}

fn default_stripe_tolerance() -> Duration {
    Duration::from_secs(300)
}

impl Default for WebhookSecrets {
    fn default() -> Self {
        Self {
            stripe: None,
            twilio: None,
            whatsapp: None,
            email: None,
            stripe_tolerance: default_stripe_tolerance(),
        }
    }
}

impl WebhookSecrets {
    pub fn for_provider(&self, provider: Provider) -> Option<&str> {
        let secret = match provider {
            Provider::Stripe => &self.stripe,
            Provider::Twilio => &self.twilio,
            Provider::Whatsapp => &self.whatsapp,
            Provider::Email => &self.email,
        };
        secret.as_deref().filter(|s| !s.is_empty())
    }
}

impl core::fmt::Debug for WebhookSecrets {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mask = |s: &Option<String>| if s.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("WebhookSecrets")
            .field("stripe", &mask(&self.stripe))
            .field("twilio", &mask(&self.twilio))
            .field("whatsapp", &mask(&self.whatsapp))
            .field("email", &mask(&self.email))
            .field("stripe_tolerance", &self.stripe_tolerance)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secrets() {
        let secrets = WebhookSecrets {
            stripe: Some("whsec_super_secret".into()),
            ..WebhookSecrets::default()
        };
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("whsec_super_secret"));
        assert!(rendered.contains("<set>"));
    }

    #[test]
    fn empty_secret_counts_as_unconfigured() {
        let secrets = WebhookSecrets {
            email: Some(String::new()),
            ..WebhookSecrets::default()
        };
        assert_eq!(secrets.for_provider(Provider::Email), None);
    }
}
