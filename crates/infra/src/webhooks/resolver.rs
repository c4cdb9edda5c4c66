use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tenantflow_core::TenantId;

/// Provider-side identifier a tenant is looked up by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TenantLookup {
    StripeCustomer(String),
    /// E.164 number a Twilio message or call was sent to.
    PhoneNumber(String),
    WhatsappPhoneNumberId(String),
    EmailAddress(String),
}

impl TenantLookup {
    /// Canonical form: trimmed, e-mail addresses lower-cased.
    pub fn normalized(&self) -> Self {
        match self {
            TenantLookup::StripeCustomer(id) => TenantLookup::StripeCustomer(id.trim().to_string()),
            TenantLookup::PhoneNumber(n) => {
                TenantLookup::PhoneNumber(n.chars().filter(|c| !c.is_whitespace()).collect())
            }
            TenantLookup::WhatsappPhoneNumberId(id) => {
                TenantLookup::WhatsappPhoneNumberId(id.trim().to_string())
            }
            TenantLookup::EmailAddress(addr) => {
                TenantLookup::EmailAddress(addr.trim().to_ascii_lowercase())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TenantLookup::StripeCustomer(_) => "stripe_customer",
            TenantLookup::PhoneNumber(_) => "phone_number",
            TenantLookup::WhatsappPhoneNumberId(_) => "whatsapp_phone_number_id",
            TenantLookup::EmailAddress(_) => "email_address",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            TenantLookup::StripeCustomer(v)
            | TenantLookup::PhoneNumber(v)
            | TenantLookup::WhatsappPhoneNumberId(v)
            | TenantLookup::EmailAddress(v) => v,
        }
    }
}

impl core::fmt::Display for TenantLookup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TenantLookup::StripeCustomer(v) => write!(f, "stripe_customer:{v}"),
            TenantLookup::PhoneNumber(v) => write!(f, "phone:{v}"),
            TenantLookup::WhatsappPhoneNumberId(v) => write!(f, "whatsapp_phone_number_id:{v}"),
            TenantLookup::EmailAddress(v) => write!(f, "email:{v}"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("tenant directory unavailable: {0}")]
    Unavailable(String),
    #[error("tenant directory storage error: {0}")]
    Storage(String),
}

/// Maps provider identifiers to tenants. `Ok(None)` means no tenant owns the
/// identifier.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, lookup: &TenantLookup) -> Result<Option<TenantId>, ResolveError>;
}

#[async_trait]
impl<R> TenantResolver for Arc<R>
where
    R: TenantResolver + ?Sized,
{
    async fn resolve(&self, lookup: &TenantLookup) -> Result<Option<TenantId>, ResolveError> {
        (**self).resolve(lookup).await
    }
}

/// A resolver that can also record new lookups.
#[async_trait]
pub trait TenantDirectory: TenantResolver {
    async fn register(&self, lookup: TenantLookup, tenant_id: TenantId) -> Result<(), ResolveError>;
}

#[async_trait]
impl<D> TenantDirectory for Arc<D>
where
    D: TenantDirectory + ?Sized,
{
    async fn register(&self, lookup: TenantLookup, tenant_id: TenantId) -> Result<(), ResolveError> {
        (**self).register(lookup, tenant_id).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTenantResolver {
    entries: RwLock<HashMap<TenantLookup, TenantId>>,
}

impl InMemoryTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, lookup: TenantLookup, tenant_id: TenantId) -> Self {
        self.register(lookup, tenant_id);
        self
    }

    pub fn register(&self, lookup: TenantLookup, tenant_id: TenantId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(lookup.normalized(), tenant_id);
        }
    }
}

#[async_trait]
impl TenantResolver for InMemoryTenantResolver {
    async fn resolve(&self, lookup: &TenantLookup) -> Result<Option<TenantId>, ResolveError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ResolveError::Unavailable("tenant directory poisoned".into()))?;
        Ok(entries.get(&lookup.normalized()).copied())
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantResolver {
    async fn register(&self, lookup: TenantLookup, tenant_id: TenantId) -> Result<(), ResolveError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ResolveError::Unavailable("tenant directory poisoned".into()))?;
        entries.insert(lookup.normalized(), tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookups_are_normalized() {
        let tenant = TenantId::new();
        let resolver = InMemoryTenantResolver::new()
            .with(TenantLookup::EmailAddress("Support@Acme.test".into()), tenant)
            .with(TenantLookup::PhoneNumber("+1 555 000 1111".into()), tenant);

        let by_email = resolver
            .resolve(&TenantLookup::EmailAddress(" support@acme.test ".into()))
            .await
            .unwrap();
        assert_eq!(by_email, Some(tenant));

        let by_phone = resolver
            .resolve(&TenantLookup::PhoneNumber("+15550001111".into()))
            .await
            .unwrap();
        assert_eq!(by_phone, Some(tenant));

        let unknown = resolver
            .resolve(&TenantLookup::StripeCustomer("cus_missing".into()))
            .await
            .unwrap();
        assert_eq!(unknown, None);
    }

    #[tokio::test]
    async fn registered_lookups_resolve_through_the_directory() {
        let tenant = TenantId::new();
        let directory: Arc<dyn TenantDirectory> = Arc::new(InMemoryTenantResolver::new());
        directory
            .register(TenantLookup::StripeCustomer(" cus_9 ".into()), tenant)
            .await
            .unwrap();

        let found = directory
            .resolve(&TenantLookup::StripeCustomer("cus_9".into()))
            .await
            .unwrap();
        assert_eq!(found, Some(tenant));
    }
}
