//! Provider signature verification.
//!
//! Every check compares in constant time and fails closed: a missing header,
//! a malformed header or an unconfigured secret is a rejection.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
pub const TWILIO_SIGNATURE_HEADER: &str = "x-twilio-signature";
pub const WHATSAPP_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EMAIL_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("no secret configured for {0}")]
    NotConfigured(&'static str),
    #[error("missing signature header `{0}`")]
    MissingHeader(&'static str),
    #[error("malformed signature header: {0}")]
    Malformed(String),
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

fn hmac_sha256(secret: &[u8]) -> Result<HmacSha256, SignatureError> {
    <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| SignatureError::Malformed(e.to_string()))
}

/// Verify a `Stripe-Signature: t=<unix>,v1=<hex>[,v1=...]` header.
///
/// The signed payload is `"{t}.{body}"`. Any matching `v1` entry is accepted
/// so secrets can be rolled.
pub fn verify_stripe(
    header: Option<&str>,
    body: &[u8],
    secret: &str,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader(STRIPE_SIGNATURE_HEADER))?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("missing t".into()))?;
    let signed_at: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::Malformed(format!("bad timestamp `{timestamp}`")))?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed("missing v1".into()));
    }

    let age = now.timestamp().abs_diff(signed_at);
    if age > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let mut mac = hmac_sha256(secret.as_bytes())?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    let matched = candidates.iter().any(|candidate| {
        hex::decode(candidate).is_ok_and(|sig| bool::from(sig.as_slice().ct_eq(expected.as_slice())))
    });
    if matched { Ok(()) } else { Err(SignatureError::Mismatch) }
}

/// Verify `X-Twilio-Signature`: base64 HMAC-SHA1 over the full URL followed
/// by every form parameter as `key + value`, sorted by key.
pub fn verify_twilio(
    header: Option<&str>,
    url: &str,
    params: &[(String, String)],
    auth_token: &str,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader(TWILIO_SIGNATURE_HEADER))?;
    let provided = BASE64
        .decode(header.trim())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;

    let mut mac = <HmacSha1 as Mac>::new_from_slice(auth_token.as_bytes())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    mac.update(url.as_bytes());
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    for (key, value) in sorted {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }

    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verify Meta's `X-Hub-Signature-256: sha256=<hex>` over the raw body.
pub fn verify_hub_sha256(
    header: Option<&str>,
    body: &[u8],
    app_secret: &str,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader(WHATSAPP_SIGNATURE_HEADER))?;
    let hex_sig = header
        .trim()
        .strip_prefix("sha256=")
        .ok_or_else(|| SignatureError::Malformed("expected `sha256=` prefix".into()))?;
    let provided = hex::decode(hex_sig).map_err(|e| SignatureError::Malformed(e.to_string()))?;

    let mut mac = hmac_sha256(app_secret.as_bytes())?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

/// Compare a shared-secret header against the configured secret.
pub fn verify_shared_secret(header: Option<&str>, secret: &str) -> Result<(), SignatureError> {
    let provided = header.ok_or(SignatureError::MissingHeader(EMAIL_SECRET_HEADER))?;
    if bool::from(provided.as_bytes().ct_eq(secret.as_bytes())) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Signing helpers for tests and local tooling.
pub mod sign {
    use super::*;

    pub fn stripe(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, SignatureError> {
        let mut mac = hmac_sha256(secret.as_bytes())?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes())))
    }

    pub fn twilio(
        auth_token: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<String, SignatureError> {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(auth_token.as_bytes())
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        mac.update(url.as_bytes());
        let mut sorted: Vec<&(String, String)> = params.iter().collect();
        sorted.sort();
        for (key, value) in sorted {
            mac.update(key.as_bytes());
            mac.update(value.as_bytes());
        }
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    pub fn hub_sha256(app_secret: &str, body: &[u8]) -> Result<String, SignatureError> {
        let mut mac = hmac_sha256(app_secret.as_bytes())?;
        mac.update(body);
        Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn stripe_accepts_valid_and_rolled_signatures() {
        let now = Utc::now();
        let body = br#"{"id":"evt_123"}"#;
        let header = sign::stripe(SECRET, now.timestamp(), body).unwrap();
        assert!(verify_stripe(Some(&header), body, SECRET, now, Duration::from_secs(300)).is_ok());

        let rolled = format!("{header},v1=deadbeef");
        assert!(verify_stripe(Some(&rolled), body, SECRET, now, Duration::from_secs(300)).is_ok());
    }

    #[test]
    fn stripe_rejects_tampering_and_replay() {
        let now = Utc::now();
        let body = br#"{"id":"evt_123"}"#;
        let header = sign::stripe(SECRET, now.timestamp(), body).unwrap();

        assert_eq!(
            verify_stripe(Some(&header), br#"{"id":"evt_124"}"#, SECRET, now, Duration::from_secs(300)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_stripe(
                Some(&header),
                body,
                SECRET,
                now + chrono::Duration::seconds(301),
                Duration::from_secs(300)
            ),
            Err(SignatureError::Expired)
        );
        assert!(matches!(
            verify_stripe(Some("v1=abc"), body, SECRET, now, Duration::from_secs(300)),
            Err(SignatureError::Malformed(_))
        ));
        assert_eq!(
            verify_stripe(None, body, SECRET, now, Duration::from_secs(300)),
            Err(SignatureError::MissingHeader(STRIPE_SIGNATURE_HEADER))
        );
    }

    #[test]
    fn twilio_signature_ignores_parameter_order() {
        let url = "https://hooks.example.com/webhooks/twilio";
        let params = vec![
            ("To".to_string(), "+15550001111".to_string()),
            ("Body".to_string(), "hi".to_string()),
            ("MessageSid".to_string(), "SM1".to_string()),
        ];
        let header = sign::twilio("token", url, &params).unwrap();

        let mut shuffled = params.clone();
        shuffled.reverse();
        assert!(verify_twilio(Some(&header), url, &shuffled, "token").is_ok());
        assert_eq!(
            verify_twilio(Some(&header), "https://other.example.com/", &params, "token"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn hub_signature_requires_prefix() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let header = sign::hub_sha256("app-secret", body).unwrap();
        assert!(verify_hub_sha256(Some(&header), body, "app-secret").is_ok());
        assert!(matches!(
            verify_hub_sha256(Some(header.trim_start_matches("sha256=")), body, "app-secret"),
            Err(SignatureError::Malformed(_))
        ));
        assert_eq!(
            verify_hub_sha256(Some(&header), body, "other"),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn shared_secret_comparison() {
        assert!(verify_shared_secret(Some("s3cret"), "s3cret").is_ok());
        assert_eq!(verify_shared_secret(Some("s3cre"), "s3cret"), Err(SignatureError::Mismatch));
        assert_eq!(
            verify_shared_secret(None, "s3cret"),
            Err(SignatureError::MissingHeader(EMAIL_SECRET_HEADER))
        );
    }
}
