//! Default provisioning pipeline for a freshly paid workspace.
//!
//! Each step derives its resource identifiers from the tenant id and the job
//! metadata, so a re-run after a crash produces the same output.

use std::sync::Arc;

use async_trait::async_trait;

use tenantflow_infra::jobs::{
    Pipeline, PipelineError, ProvisioningStep, StepContext, StepError, StepOutput,
};

pub const BILLING_ACCOUNT: &str = "billing_account";
pub const MESSAGING_CHANNEL: &str = "messaging_channel";
pub const DEFAULT_WORKFLOWS: &str = "default_workflows";

const DEFAULT_WORKFLOW_TEMPLATES: [&str; 3] = ["lead_intake", "appointment_reminder", "follow_up"];

pub fn default_pipeline() -> Result<Pipeline, PipelineError> {
    let steps: Vec<Arc<dyn ProvisioningStep>> = vec![
        Arc::new(BillingAccountStep),
        Arc::new(MessagingChannelStep),
        Arc::new(DefaultWorkflowsStep),
    ];
    Pipeline::new(steps)
}

fn metadata_str<'a>(ctx: &'a StepContext, pointer: &str) -> Option<&'a str> {
    ctx.metadata
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Links the workspace to its billing customer.
pub struct BillingAccountStep;

#[async_trait]
impl ProvisioningStep for BillingAccountStep {
    fn id(&self) -> &str {
        BILLING_ACCOUNT
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let customer_id = metadata_str(ctx, "/stripe_customer_id")
            .map(str::to_string)
            .unwrap_or_else(|| format!("local_{}", ctx.tenant_id));
        Ok(StepOutput::BillingAccount {
            customer_id,
            subscription_id: metadata_str(ctx, "/stripe_subscription_id").map(str::to_string),
        })
    }
}

/// Allocates the inbound e-mail channel.
pub struct MessagingChannelStep;

#[async_trait]
impl ProvisioningStep for MessagingChannelStep {
    fn id(&self) -> &str {
        MESSAGING_CHANNEL
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        if ctx.outputs.get(BILLING_ACCOUNT).is_none() {
            return Err(StepError::permanent("billing account missing"));
        }
        let address = match metadata_str(ctx, "/inbound_address") {
            Some(addr) if !addr.contains('@') => {
                return Err(StepError::permanent(format!("invalid inbound address `{addr}`")));
            }
            Some(addr) => addr.to_ascii_lowercase(),
            None => format!("{}@inbound.tenantflow.local", ctx.tenant_id.as_uuid().simple()),
        };
        Ok(StepOutput::MessagingChannel {
            channel: "email".into(),
            external_id: format!("chan_{}", ctx.tenant_id.as_uuid().simple()),
            address,
        })
    }
}

/// Installs the starter workflows.
pub struct DefaultWorkflowsStep;

#[async_trait]
impl ProvisioningStep for DefaultWorkflowsStep {
    fn id(&self) -> &str {
        DEFAULT_WORKFLOWS
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let tenant = ctx.tenant_id.as_uuid().simple().to_string();
        Ok(StepOutput::Workflows {
            workflow_ids: DEFAULT_WORKFLOW_TEMPLATES
                .iter()
                .map(|template| format!("{template}_{tenant}"))
                .collect(),
        })
    }
}
