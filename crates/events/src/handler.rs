use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TenantEvent;

/// Failure reported by a tenant handler.
///
/// The variant decides what happens next: retryable failures leave the
/// delivery eligible for the provider's next retry, permanent ones abandon it.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum HandlerError {
    /// Transient failure (downstream timeout, lock busy, rate limited).
    #[error("retryable: {0}")]
    Retryable(String),

    /// Business/validation failure; retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// Business handler for one provider's events.
///
/// Handlers are invoked at most once per successful delivery; the dispatcher
/// owns deduplication. Handlers must still be safe to re-run after a
/// retryable failure.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &TenantEvent) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> WebhookHandler for std::sync::Arc<H>
where
    H: WebhookHandler + ?Sized,
{
    async fn handle(&self, event: &TenantEvent) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}
