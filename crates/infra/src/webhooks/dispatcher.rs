use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use tenantflow_core::Clock;
use tenantflow_events::{HandlerError, InboundWebhook, Provider, TenantEvent, WebhookKey};

use super::handlers::WebhookHandlers;
use super::providers::{self, MalformedPayload, Parsed};
use super::resolver::{ResolveError, TenantResolver};
use super::signature::{self, SignatureError};
use super::WebhookSecrets;
use crate::idempotency::{IdempotencyError, IdempotencyGuard, IdempotentRequest, ProcessError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Malformed(#[from] MalformedPayload),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Store(#[from] IdempotencyError),
}

/// Why a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Unauthorized,
    Malformed,
}

/// Provider-facing response decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", content = "reason", rename_all = "snake_case")]
pub enum DeliveryAck {
    /// 2xx: the provider must not resend.
    Accepted,
    /// 4xx: the delivery is bad and resending will not help.
    Rejected(RejectReason),
    /// 5xx: the provider should resend later.
    RetryLater,
}

impl DeliveryAck {
    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryAck::Accepted => 200,
            DeliveryAck::Rejected(RejectReason::Malformed) => 400,
            DeliveryAck::Rejected(RejectReason::Unauthorized) => 401,
            DeliveryAck::RetryLater => 503,
        }
    }
}

/// What happened to a verified delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The handler ran and succeeded on this delivery.
    Processed { key: WebhookKey },
    /// An earlier or concurrent delivery owns the event.
    Duplicate { key: WebhookKey, processed: bool },
    /// No tenant owns the event; acknowledged without processing.
    UnresolvedTenant { key: WebhookKey },
    Ignored { provider: Provider, reason: String },
    HandlerFailed {
        key: WebhookKey,
        error: HandlerError,
        attempts: u32,
        abandoned: bool,
    },
}

impl DispatchOutcome {
    pub fn ack(&self) -> DeliveryAck {
        match self {
            DispatchOutcome::HandlerFailed {
                error, abandoned, ..
            } if error.is_retryable() && !abandoned => DeliveryAck::RetryLater,
            _ => DeliveryAck::Accepted,
        }
    }
}

impl DispatchError {
    pub fn ack(&self) -> DeliveryAck {
        match self {
            DispatchError::Signature(_) => DeliveryAck::Rejected(RejectReason::Unauthorized),
            DispatchError::Malformed(_) => DeliveryAck::Rejected(RejectReason::Malformed),
            DispatchError::Resolve(_) | DispatchError::Store(_) => DeliveryAck::RetryLater,
        }
    }
}

/// Verifies, deduplicates and executes provider webhooks.
pub struct WebhookDispatcher {
    guard: Arc<IdempotencyGuard>,
    resolver: Arc<dyn TenantResolver>,
    handlers: WebhookHandlers,
    secrets: WebhookSecrets,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatcher {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        resolver: Arc<dyn TenantResolver>,
        handlers: WebhookHandlers,
        secrets: WebhookSecrets,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            guard,
            resolver,
            handlers,
            secrets,
            clock,
        }
    }

    /// Dispatch and reduce the result to the provider-facing decision.
    pub async fn deliver(&self, delivery: &InboundWebhook) -> DeliveryAck {
        match self.dispatch(delivery).await {
            Ok(outcome) => outcome.ack(),
            Err(e) => {
                let ack = e.ack();
                match ack {
                    DeliveryAck::RetryLater => {
                        error!(provider = %delivery.provider(), error = %e, "webhook dispatch failed")
                    }
                    _ => warn!(provider = %delivery.provider(), error = %e, "webhook rejected"),
                }
                ack
            }
        }
    }

    #[instrument(skip(self, delivery), fields(provider = %delivery.provider()), err)]
    pub async fn dispatch(&self, delivery: &InboundWebhook) -> Result<DispatchOutcome, DispatchError> {
        self.verify(delivery)?;

        let provider = delivery.provider();
        let event = match providers::parse(delivery)? {
            Parsed::Event(event) => event,
            Parsed::Ignored { reason } => {
                debug!(%reason, "delivery ignored");
                return Ok(DispatchOutcome::Ignored { provider, reason });
            }
        };
        let key = WebhookKey::new(provider, event.external_id).map_err(|e| MalformedPayload {
            provider,
            reason: e.to_string(),
        })?;

        let tenant_id = match &event.lookup {
            Some(lookup) => self.resolver.resolve(lookup).await?,
            None => None,
        };
        let Some(tenant_id) = tenant_id else {
            info!(%key, lookup = ?event.lookup, "no tenant for webhook, acknowledging");
            return Ok(DispatchOutcome::UnresolvedTenant { key });
        };

        let request = IdempotentRequest::new(key.clone(), Some(tenant_id), event.payload.clone())
            .with_raw_body(delivery.body());
        let tenant_event = TenantEvent::new(tenant_id, key.clone(), event.event_type, event.payload);
        let handler = self.handlers.for_provider(provider).clone();

        match self
            .guard
            .process(request, || async move { handler.handle(&tenant_event).await })
            .await
        {
            Ok(outcome) if outcome.duplicate => Ok(DispatchOutcome::Duplicate {
                key,
                processed: outcome.processed,
            }),
            Ok(_) => Ok(DispatchOutcome::Processed { key }),
            Err(ProcessError::Store(e)) => Err(DispatchError::Store(e)),
            Err(ProcessError::Handler {
                error,
                attempts,
                abandoned,
            }) => Ok(DispatchOutcome::HandlerFailed {
                key,
                error,
                attempts,
                abandoned,
            }),
        }
    }

    fn verify(&self, delivery: &InboundWebhook) -> Result<(), SignatureError> {
        let provider = delivery.provider();
        let secret = self
            .secrets
            .for_provider(provider)
            .ok_or(SignatureError::NotConfigured(provider.as_str()))?;

        match provider {
            Provider::Stripe => signature::verify_stripe(
                delivery.header(signature::STRIPE_SIGNATURE_HEADER),
                delivery.body(),
                secret,
                self.clock.now(),
                self.secrets.stripe_tolerance,
            ),
            Provider::Twilio => signature::verify_twilio(
                delivery.header(signature::TWILIO_SIGNATURE_HEADER),
                delivery.url(),
                &providers::form_params(delivery.body()),
                secret,
            ),
            Provider::Whatsapp => signature::verify_hub_sha256(
                delivery.header(signature::WHATSAPP_SIGNATURE_HEADER),
                delivery.body(),
                secret,
            ),
            Provider::Email => {
                signature::verify_shared_secret(delivery.header(signature::EMAIL_SECRET_HEADER), secret)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tenantflow_core::{ManualClock, TenantId};
    use tenantflow_events::{WebhookHandler, WebhookStatus};

    use super::*;
    use crate::idempotency::{IdempotencyConfig, InMemoryWebhookEventStore, WebhookEventStore};
    use crate::webhooks::resolver::{InMemoryTenantResolver, TenantLookup};
    use crate::webhooks::signature::sign;

    const STRIPE_SECRET: &str = "whsec_test";

    struct Counting {
        calls: AtomicUsize,
        fail_with: Option<HandlerError>,
    }

    impl Counting {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            })
        }

        fn failing(error: HandlerError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(error),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebhookHandler for Counting {
        async fn handle(&self, _event: &TenantEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    struct Fixture {
        dispatcher: WebhookDispatcher,
        store: Arc<InMemoryWebhookEventStore>,
        clock: Arc<ManualClock>,
        tenant: TenantId,
    }

    fn fixture(stripe: Arc<Counting>) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryWebhookEventStore::new());
        let tenant = TenantId::new();
        let resolver =
            InMemoryTenantResolver::new().with(TenantLookup::StripeCustomer("cus_42".into()), tenant);
        let guard = IdempotencyGuard::new(store.clone(), clock.clone(), IdempotencyConfig::default());
        let handlers = WebhookHandlers {
            stripe,
            ..WebhookHandlers::acknowledge_all()
        };
        let secrets = WebhookSecrets {
            stripe: Some(STRIPE_SECRET.into()),
            ..WebhookSecrets::default()
        };
        Fixture {
            dispatcher: WebhookDispatcher::new(
                Arc::new(guard),
                Arc::new(resolver),
                handlers,
                secrets,
                clock.clone(),
            ),
            store,
            clock,
            tenant,
        }
    }

    fn stripe_delivery(clock: &ManualClock, id: &str, customer: &str) -> InboundWebhook {
        let body = json!({
            "id": id,
            "type": "customer.subscription.created",
            "data": {"object": {"customer": customer, "status": "active"}}
        })
        .to_string();
        let header = sign::stripe(STRIPE_SECRET, clock.now().timestamp(), body.as_bytes()).unwrap();
        InboundWebhook::new(Provider::Stripe, "https://hooks.example.com/webhooks/stripe", body)
            .with_header("Stripe-Signature", header)
    }

    #[tokio::test]
    async fn stripe_double_delivery_runs_handler_once() {
        let handler = Counting::ok();
        let f = fixture(handler.clone());
        let delivery = stripe_delivery(&f.clock, "evt_123", "cus_42");

        let first = f.dispatcher.dispatch(&delivery).await.unwrap();
        assert!(matches!(first, DispatchOutcome::Processed { .. }));
        assert_eq!(first.ack(), DeliveryAck::Accepted);

        let second = f.dispatcher.dispatch(&delivery).await.unwrap();
        assert_eq!(
            second,
            DispatchOutcome::Duplicate {
                key: WebhookKey::new(Provider::Stripe, "evt_123").unwrap(),
                processed: true,
            }
        );
        assert_eq!(second.ack(), DeliveryAck::Accepted);
        assert_eq!(handler.calls(), 1);

        let key = WebhookKey::new(Provider::Stripe, "evt_123").unwrap();
        let event = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Completed);
        assert_eq!(event.workspace_id, Some(f.tenant));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_side_effects() {
        let handler = Counting::ok();
        let f = fixture(handler.clone());
        let delivery = stripe_delivery(&f.clock, "evt_bad", "cus_42")
            .with_header("Stripe-Signature", "t=1,v1=00");

        assert_eq!(
            f.dispatcher.deliver(&delivery).await,
            DeliveryAck::Rejected(RejectReason::Unauthorized)
        );
        assert_eq!(handler.calls(), 0);
        let key = WebhookKey::new(Provider::Stripe, "evt_bad").unwrap();
        assert!(f.store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_closed() {
        let f = fixture(Counting::ok());
        let delivery = InboundWebhook::new(Provider::Email, "https://hooks.example.com", "{}")
            .with_header("X-Webhook-Secret", "anything");
        let err = f.dispatcher.dispatch(&delivery).await.unwrap_err();
        assert!(matches!(err, DispatchError::Signature(SignatureError::NotConfigured("email"))));
    }

    #[tokio::test]
    async fn unknown_customer_is_acknowledged_not_processed() {
        let handler = Counting::ok();
        let f = fixture(handler.clone());
        let delivery = stripe_delivery(&f.clock, "evt_9", "cus_unknown");

        let outcome = f.dispatcher.dispatch(&delivery).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::UnresolvedTenant { .. }));
        assert_eq!(outcome.ack(), DeliveryAck::Accepted);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn retryable_failure_asks_provider_to_retry() {
        let handler = Counting::failing(HandlerError::retryable("downstream timeout"));
        let f = fixture(handler.clone());
        let delivery = stripe_delivery(&f.clock, "evt_r", "cus_42");

        assert_eq!(f.dispatcher.deliver(&delivery).await, DeliveryAck::RetryLater);
        assert_eq!(f.dispatcher.deliver(&delivery).await, DeliveryAck::RetryLater);
        // Third attempt exhausts the default cap of 3.
        assert_eq!(f.dispatcher.deliver(&delivery).await, DeliveryAck::Accepted);
        assert_eq!(f.dispatcher.deliver(&delivery).await, DeliveryAck::Accepted);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_accepted_and_recorded() {
        let handler = Counting::failing(HandlerError::permanent("unknown plan"));
        let f = fixture(handler.clone());
        let delivery = stripe_delivery(&f.clock, "evt_p", "cus_42");

        assert_eq!(f.dispatcher.deliver(&delivery).await, DeliveryAck::Accepted);
        let key = WebhookKey::new(Provider::Stripe, "evt_p").unwrap();
        let event = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(event.status, WebhookStatus::Failed);
        assert!(event.error.unwrap().contains("unknown plan"));
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let f = fixture(Counting::ok());
        let body = "not json";
        let header = sign::stripe(STRIPE_SECRET, f.clock.now().timestamp(), body.as_bytes()).unwrap();
        let delivery = InboundWebhook::new(Provider::Stripe, "https://hooks.example.com", body)
            .with_header("Stripe-Signature", header);

        assert_eq!(
            f.dispatcher.deliver(&delivery).await,
            DeliveryAck::Rejected(RejectReason::Malformed)
        );
    }

    #[test]
    fn handler_failures_serialize_with_their_kind() {
        let outcome = DispatchOutcome::HandlerFailed {
            key: WebhookKey::new(Provider::Stripe, "evt_9").unwrap(),
            error: HandlerError::retryable("billing api timeout"),
            attempts: 2,
            abandoned: false,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "handler_failed");
        assert_eq!(value["error"], json!({"kind": "retryable", "message": "billing api timeout"}));

        let back: DispatchOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back.ack(), DeliveryAck::RetryLater);
    }
}
