//! Inbound provider events: the vocabulary shared by the webhook dispatcher,
//! the idempotency store and tenant handlers.

pub mod envelope;
pub mod handler;
pub mod provider;
pub mod webhook;

pub use envelope::{InboundWebhook, TenantEvent};
pub use handler::{HandlerError, WebhookHandler};
pub use provider::Provider;
pub use webhook::{WebhookEvent, WebhookKey, WebhookStatus};
