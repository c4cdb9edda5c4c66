//! Persisted webhook delivery record (the idempotency ledger row).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tenantflow_core::{DomainError, TenantId};

use crate::provider::Provider;

/// Idempotency key: `(source, external_id)`.
///
/// The payload is not part of the identity: providers re-sign
/// and resend identical events, so only the provider's own id is stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WebhookKey {
    pub source: Provider,
    pub external_id: String,
}

impl WebhookKey {
    /// Maximum accepted external id length (matches the column width).
    pub const MAX_EXTERNAL_ID_LEN: usize = 255;

    pub fn new(source: Provider, external_id: impl Into<String>) -> Result<Self, DomainError> {
        let external_id = external_id.into().trim().to_string();
        if external_id.is_empty() {
            return Err(DomainError::validation("external id cannot be empty"));
        }
        if external_id.len() > Self::MAX_EXTERNAL_ID_LEN {
            return Err(DomainError::validation(format!(
                "external id exceeds {} characters",
                Self::MAX_EXTERNAL_ID_LEN
            )));
        }
        Ok(Self {
            source,
            external_id,
        })
    }
}

impl core::fmt::Display for WebhookKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// Processing status of a webhook delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    /// Recorded, eligible for a future attempt.
    Pending,
    /// Claimed by an in-flight invocation.
    Processing,
    /// Handler succeeded. Terminal and immutable.
    Completed,
    /// Abandoned (attempts exhausted or permanent handler failure).
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Pending => "pending",
            WebhookStatus::Processing => "processing",
            WebhookStatus::Completed => "completed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(WebhookStatus::Pending),
            "processing" => Ok(WebhookStatus::Processing),
            "completed" => Ok(WebhookStatus::Completed),
            "failed" => Ok(WebhookStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown webhook status: {other}"
            ))),
        }
    }
}

/// One row per `(source, external_id)`. Never deleted (audit trail).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub key: WebhookKey,
    pub workspace_id: Option<TenantId>,
    pub status: WebhookStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Raw payload, kept for audit only. Never used for control flow.
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether an in-flight claim has outlived the processing timeout.
    pub fn is_stale_processing(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.status == WebhookStatus::Processing && self.updated_at + timeout <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_trims_and_validates_external_id() {
        let key = WebhookKey::new(Provider::Stripe, "  evt_123 ").unwrap();
        assert_eq!(key.external_id, "evt_123");
        assert_eq!(key.to_string(), "stripe:evt_123");

        assert!(WebhookKey::new(Provider::Stripe, "   ").is_err());
        assert!(WebhookKey::new(Provider::Email, "x".repeat(300)).is_err());
    }

    #[test]
    fn status_names_round_trip() {
        for status in [
            WebhookStatus::Pending,
            WebhookStatus::Processing,
            WebhookStatus::Completed,
            WebhookStatus::Failed,
        ] {
            assert_eq!(WebhookStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
