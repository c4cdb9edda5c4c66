use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tenantflow_core::TenantId;

use crate::provider::Provider;
use crate::webhook::WebhookKey;

/// A raw webhook delivery exactly as it arrived.
///
/// The body is kept as bytes: signatures are computed over the exact wire
/// representation, so nothing may re-encode it before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundWebhook {
    provider: Provider,
    /// Full public URL the provider called (Twilio signs it).
    url: String,
    /// Header names are stored lower-cased.
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl InboundWebhook {
    pub fn new(provider: Provider, url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            provider,
            url: url.into(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// A verified, parsed provider event whose tenant has been resolved.
///
/// This is what tenant handlers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantEvent {
    tenant_id: TenantId,
    key: WebhookKey,
    /// Provider event type (e.g. `customer.subscription.created`,
    /// `message.received`).
    event_type: String,
    payload: serde_json::Value,
}

impl TenantEvent {
    pub fn new(
        tenant_id: TenantId,
        key: WebhookKey,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            key,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn key(&self) -> &WebhookKey {
        &self.key
    }

    pub fn provider(&self) -> Provider {
        self.key.source
    }

    pub fn external_id(&self) -> &str {
        &self.key.external_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}
