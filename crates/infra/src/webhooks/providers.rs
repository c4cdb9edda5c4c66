//! Per-provider payload parsing.
//!
//! Each parser extracts the stable external id, the event type and the
//! identifier the tenant is looked up by. Parsing runs only after the
//! signature has been verified.

use serde_json::{Map, Value};
use url::form_urlencoded;

use tenantflow_events::{InboundWebhook, Provider};

use super::resolver::TenantLookup;

/// A verified delivery reduced to what the dispatcher needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Event(ParsedEvent),
    /// Well-formed but carries nothing to process (e.g. a WhatsApp
    /// verification ping).
    Ignored { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub external_id: String,
    pub event_type: String,
    /// `None` when the payload names no tenant-identifying field.
    pub lookup: Option<TenantLookup>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {provider} payload: {reason}")]
pub struct MalformedPayload {
    pub provider: Provider,
    pub reason: String,
}

impl MalformedPayload {
    fn new(provider: Provider, reason: impl Into<String>) -> Self {
        Self {
            provider,
            reason: reason.into(),
        }
    }
}

/// Form parameters of a Twilio delivery, in wire order.
pub fn form_params(body: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(body).into_owned().collect()
}

pub fn parse(delivery: &InboundWebhook) -> Result<Parsed, MalformedPayload> {
    match delivery.provider() {
        Provider::Stripe => parse_stripe(delivery.body()),
        Provider::Twilio => parse_twilio(delivery.body()),
        Provider::Whatsapp => parse_whatsapp(delivery.body()),
        Provider::Email => parse_email(delivery.body()),
    }
}

fn json_body(provider: Provider, body: &[u8]) -> Result<Value, MalformedPayload> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| MalformedPayload::new(provider, format!("invalid json: {e}")))?;
    if !value.is_object() {
        return Err(MalformedPayload::new(provider, "expected a json object"));
    }
    Ok(value)
}

fn non_empty_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_stripe(body: &[u8]) -> Result<Parsed, MalformedPayload> {
    let payload = json_body(Provider::Stripe, body)?;
    let external_id = non_empty_str(&payload, "/id")
        .ok_or_else(|| MalformedPayload::new(Provider::Stripe, "missing `id`"))?
        .to_string();
    let event_type = non_empty_str(&payload, "/type")
        .ok_or_else(|| MalformedPayload::new(Provider::Stripe, "missing `type`"))?
        .to_string();
    let lookup = non_empty_str(&payload, "/data/object/customer")
        .map(|customer| TenantLookup::StripeCustomer(customer.to_string()));

    Ok(Parsed::Event(ParsedEvent {
        external_id,
        event_type,
        lookup,
        payload,
    }))
}

fn parse_twilio(body: &[u8]) -> Result<Parsed, MalformedPayload> {
    let params = form_params(body);
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    };

    let (external_id, event_type) = if let Some(sid) = get("MessageSid").or_else(|| get("SmsSid")) {
        let kind = if get("MessageStatus").or_else(|| get("SmsStatus")).is_some() && get("Body").is_none() {
            "message.status"
        } else {
            "message.received"
        };
        (sid.to_string(), kind)
    } else if let Some(sid) = get("CallSid") {
        (sid.to_string(), "call.status")
    } else {
        return Err(MalformedPayload::new(
            Provider::Twilio,
            "missing MessageSid, CallSid or SmsSid",
        ));
    };

    let lookup = get("To").map(|to| TenantLookup::PhoneNumber(to.to_string()));
    let payload = Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    );

    Ok(Parsed::Event(ParsedEvent {
        external_id,
        event_type: event_type.to_string(),
        lookup,
        payload,
    }))
}

fn parse_whatsapp(body: &[u8]) -> Result<Parsed, MalformedPayload> {
    let payload = json_body(Provider::Whatsapp, body)?;
    let Some(value) = payload.pointer("/entry/0/changes/0/value") else {
        return Ok(Parsed::Ignored {
            reason: "no entry changes".into(),
        });
    };

    let (external_id, event_type) = if let Some(id) = non_empty_str(value, "/messages/0/id") {
        (id.to_string(), "message.received")
    } else if let Some(id) = non_empty_str(value, "/statuses/0/id") {
        // Status updates reuse the message id; suffix the status so delivered
        // and read receipts are distinct events.
        let status = non_empty_str(value, "/statuses/0/status").unwrap_or("unknown");
        (format!("{id}:{status}"), "message.status")
    } else {
        return Ok(Parsed::Ignored {
            reason: "no messages or statuses".into(),
        });
    };

    let lookup = non_empty_str(value, "/metadata/phone_number_id")
        .map(|id| TenantLookup::WhatsappPhoneNumberId(id.to_string()));

    Ok(Parsed::Event(ParsedEvent {
        external_id,
        event_type: event_type.to_string(),
        lookup,
        payload,
    }))
}

fn parse_email(body: &[u8]) -> Result<Parsed, MalformedPayload> {
    let payload = json_body(Provider::Email, body)?;
    let external_id = non_empty_str(&payload, "/message_id")
        .ok_or_else(|| MalformedPayload::new(Provider::Email, "missing `message_id`"))?
        .to_string();
    let event_type = non_empty_str(&payload, "/event")
        .unwrap_or("email.received")
        .to_string();
    let to = non_empty_str(&payload, "/to").or_else(|| non_empty_str(&payload, "/to/0"));
    let lookup = to.map(|addr| TenantLookup::EmailAddress(addr.to_string()));

    Ok(Parsed::Event(ParsedEvent {
        external_id,
        event_type,
        lookup,
        payload,
    }))
}
