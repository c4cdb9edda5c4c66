//! Postgres-backed tenant directory over `tenant_lookups`.
//!
//! Lookups are stored normalized, so resolution is a primary-key read.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use tenantflow_core::TenantId;

use super::resolver::{ResolveError, TenantDirectory, TenantLookup, TenantResolver};
use crate::postgres::{SqlFailure, classify};

#[derive(Debug, Clone)]
pub struct PostgresTenantDirectory {
    pool: Arc<PgPool>,
}

impl PostgresTenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TenantResolver for PostgresTenantDirectory {
    #[instrument(skip(self), fields(lookup = %lookup), err)]
    async fn resolve(&self, lookup: &TenantLookup) -> Result<Option<TenantId>, ResolveError> {
        let lookup = lookup.normalized();
        let tenant: Option<Uuid> = sqlx::query_scalar(
            "SELECT workspace_id FROM tenant_lookups WHERE kind = $1 AND value = $2",
        )
        .bind(lookup.kind())
        .bind(lookup.value())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve", e))?;

        Ok(tenant.map(TenantId::from_uuid))
    }
}

#[async_trait]
impl TenantDirectory for PostgresTenantDirectory {
    /// Insert or re-point the lookup at `tenant_id`.
    #[instrument(skip(self), fields(lookup = %lookup, tenant_id = %tenant_id), err)]
    async fn register(&self, lookup: TenantLookup, tenant_id: TenantId) -> Result<(), ResolveError> {
        let lookup = lookup.normalized();
        sqlx::query(
            r#"
            INSERT INTO tenant_lookups (kind, value, workspace_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, value) DO UPDATE SET workspace_id = EXCLUDED.workspace_id
            "#,
        )
        .bind(lookup.kind())
        .bind(lookup.value())
        .bind(tenant_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ResolveError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => ResolveError::Unavailable(msg),
        SqlFailure::Conflict(msg) | SqlFailure::Invalid(msg) => ResolveError::Storage(msg),
    }
}
