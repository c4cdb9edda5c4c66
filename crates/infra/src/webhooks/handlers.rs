use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use tenantflow_events::{HandlerError, Provider, TenantEvent, WebhookHandler};

use crate::jobs::{EngineError, EnqueueRequest, JobSource, JobStoreError, ProvisioningEngine};

/// One handler slot per provider.
#[derive(Clone)]
pub struct WebhookHandlers {
    pub stripe: Arc<dyn WebhookHandler>,
    pub twilio: Arc<dyn WebhookHandler>,
    pub whatsapp: Arc<dyn WebhookHandler>,
    pub email: Arc<dyn WebhookHandler>,
}

impl WebhookHandlers {
    /// Every provider acknowledged and logged.
    pub fn acknowledge_all() -> Self {
        let ack: Arc<dyn WebhookHandler> = Arc::new(AcknowledgeHandler);
        Self {
            stripe: ack.clone(),
            twilio: ack.clone(),
            whatsapp: ack.clone(),
            email: ack,
        }
    }

    /// Stripe activations enqueue provisioning; everything else is logged.
    pub fn with_provisioning(engine: Arc<ProvisioningEngine>) -> Self {
        Self {
            stripe: Arc::new(ProvisioningTriggerHandler::new(engine)),
            ..Self::acknowledge_all()
        }
    }

    pub fn for_provider(&self, provider: Provider) -> &Arc<dyn WebhookHandler> {
        match provider {
            Provider::Stripe => &self.stripe,
            Provider::Twilio => &self.twilio,
            Provider::Whatsapp => &self.whatsapp,
            Provider::Email => &self.email,
        }
    }
}

/// Logs the event and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

#[async_trait]
impl WebhookHandler for AcknowledgeHandler {
    async fn handle(&self, event: &TenantEvent) -> Result<(), HandlerError> {
        info!(
            tenant_id = %event.tenant_id(),
            key = %event.key(),
            event_type = event.event_type(),
            "webhook acknowledged"
        );
        Ok(())
    }
}

/// Enqueues automatic provisioning when a Stripe subscription becomes active.
pub struct ProvisioningTriggerHandler {
    engine: Arc<ProvisioningEngine>,
}

impl ProvisioningTriggerHandler {
    pub fn new(engine: Arc<ProvisioningEngine>) -> Self {
        Self { engine }
    }

    /// Whether the event activates a paid workspace.
    pub fn is_activation(event: &TenantEvent) -> bool {
        let status = event
            .payload()
            .pointer("/data/object/status")
            .and_then(|s| s.as_str());
        match event.event_type() {
            "checkout.session.completed" => true,
            "customer.subscription.created" | "customer.subscription.updated" => {
                matches!(status, Some("active" | "trialing"))
            }
            _ => false,
        }
    }
}

fn subscription_id(event: &TenantEvent) -> Option<&str> {
    let object = event.payload().pointer("/data/object")?;
    match event.event_type() {
        "checkout.session.completed" => object.get("subscription")?.as_str(),
        _ => object.get("id")?.as_str(),
    }
}

#[async_trait]
impl WebhookHandler for ProvisioningTriggerHandler {
    async fn handle(&self, event: &TenantEvent) -> Result<(), HandlerError> {
        if !Self::is_activation(event) {
            debug!(key = %event.key(), event_type = event.event_type(), "not a provisioning trigger");
            return Ok(());
        }

        let request = EnqueueRequest {
            source: JobSource::Automatic,
            metadata: json!({
                "trigger": event.event_type(),
                "stripe_event_id": event.external_id(),
                "stripe_customer_id": event.payload().pointer("/data/object/customer"),
                "stripe_subscription_id": subscription_id(event),
            }),
        };
        let outcome = self
            .engine
            .enqueue(event.tenant_id(), request)
            .await
            .map_err(|e| match e {
                EngineError::Store(JobStoreError::Unavailable(_)) | EngineError::Lock(_) => {
                    HandlerError::retryable(e.to_string())
                }
                other => HandlerError::permanent(other.to_string()),
            })?;

        info!(
            tenant_id = %event.tenant_id(),
            job_id = %outcome.job_id,
            created = outcome.created,
            "provisioning triggered by stripe"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tenantflow_core::{ManualClock, TenantId};
    use tenantflow_events::WebhookKey;

    use super::*;
    use crate::jobs::{InMemoryJobStore, Pipeline, ProvisioningConfig, StaticStep, StepOutput};
    use crate::lock::{InMemoryLockStore, LockConfig, LockManager};

    fn engine() -> Arc<ProvisioningEngine> {
        let clock = Arc::new(ManualClock::starting_now());
        let locks = LockManager::new(
            Arc::new(InMemoryLockStore::new()),
            clock.clone(),
            LockConfig::default(),
        );
        let pipeline = Pipeline::new(vec![Arc::new(StaticStep::new(
            "billing",
            StepOutput::Custom {
                data: serde_json::Value::Null,
            },
        ))])
        .unwrap();
        Arc::new(ProvisioningEngine::new(
            InMemoryJobStore::arc(),
            locks,
            Arc::new(pipeline),
            clock,
            ProvisioningConfig::default(),
        ))
    }

    fn stripe_event(tenant: TenantId, event_type: &str, status: &str) -> TenantEvent {
        TenantEvent::new(
            tenant,
            WebhookKey::new(Provider::Stripe, "evt_1").unwrap(),
            event_type,
            json!({"data": {"object": {"status": status}}}),
        )
    }

    #[tokio::test]
    async fn activation_enqueues_automatic_job_once() {
        let engine = engine();
        let handler = ProvisioningTriggerHandler::new(engine.clone());
        let tenant = TenantId::new();

        let event = stripe_event(tenant, "customer.subscription.created", "active");
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        let job = engine.status(tenant).await.unwrap().unwrap();
        assert_eq!(job.source, JobSource::Automatic);
        assert_eq!(job.metadata["stripe_event_id"], "evt_1");
    }

    #[tokio::test]
    async fn inactive_subscriptions_are_ignored() {
        let engine = engine();
        let handler = ProvisioningTriggerHandler::new(engine.clone());
        let tenant = TenantId::new();

        handler
            .handle(&stripe_event(tenant, "customer.subscription.updated", "past_due"))
            .await
            .unwrap();
        handler
            .handle(&stripe_event(tenant, "invoice.paid", "paid"))
            .await
            .unwrap();
        assert!(engine.status(tenant).await.unwrap().is_none());
    }
}
