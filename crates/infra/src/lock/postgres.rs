//! Postgres-backed lock store.
//!
//! One row per `(tenant_id, resource_kind)`. Acquisition is a conditional
//! upsert that only overwrites a row which is free, expired, or already owned
//! by the caller. Rows are never deleted: release blanks `holder_id` so the
//! `version` fencing counter keeps increasing across acquisitions.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use tenantflow_core::TenantId;

use super::{HolderId, LockError, LockKey, LockRecord, LockStore, ResourceKind};
use crate::postgres::{SqlFailure, classify};

#[derive(Debug, Clone)]
pub struct PostgresLockStore {
    pool: Arc<PgPool>,
}

impl PostgresLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl LockStore for PostgresLockStore {
    #[instrument(skip(self, holder), fields(key = %key), err)]
    async fn try_acquire(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, LockError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO tenant_locks (tenant_id, resource_kind, holder_id, acquired_at, expires_at, version)
            VALUES ($1, $2, $3, $4, $5, 1)
            ON CONFLICT (tenant_id, resource_kind) DO UPDATE
            SET holder_id = EXCLUDED.holder_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                version = tenant_locks.version + 1
            WHERE tenant_locks.holder_id = ''
               OR tenant_locks.expires_at <= EXCLUDED.acquired_at
               OR tenant_locks.holder_id = EXCLUDED.holder_id
            RETURNING version
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.resource.as_str())
        .bind(holder.as_str())
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire", e))?;

        Ok(version.map(|version| LockRecord {
            key: key.clone(),
            holder: holder.clone(),
            acquired_at: now,
            expires_at,
            version: version.max(0) as u64,
        }))
    }

    #[instrument(skip(self, holder), fields(key = %key), err)]
    async fn release(&self, key: &LockKey, holder: &HolderId) -> Result<bool, LockError> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_locks
            SET holder_id = '', expires_at = acquired_at
            WHERE tenant_id = $1 AND resource_kind = $2 AND holder_id = $3
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.resource.as_str())
        .bind(holder.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, holder), fields(key = %key), err)]
    async fn extend(
        &self,
        key: &LockKey,
        holder: &HolderId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_locks
            SET expires_at = $4
            WHERE tenant_id = $1 AND resource_kind = $2 AND holder_id = $3 AND expires_at > $5
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.resource.as_str())
        .bind(holder.as_str())
        .bind(expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn force_release(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
            UPDATE tenant_locks AS t
            SET holder_id = '', expires_at = t.acquired_at
            FROM (
                SELECT tenant_id, resource_kind, holder_id, acquired_at, expires_at, version
                FROM tenant_locks
                WHERE tenant_id = $1 AND resource_kind = $2 AND holder_id <> ''
                FOR UPDATE
            ) AS old
            WHERE t.tenant_id = old.tenant_id AND t.resource_kind = old.resource_kind
            RETURNING old.tenant_id, old.resource_kind, old.holder_id,
                      old.acquired_at, old.expires_at, old.version
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.resource.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("force_release", e))?;

        row.map(LockRecord::try_from).transpose()
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT tenant_id, resource_kind, holder_id, acquired_at, expires_at, version
            FROM tenant_locks
            WHERE tenant_id = $1 AND resource_kind = $2 AND holder_id <> ''
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.resource.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(LockRecord::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LockRecord>, LockError> {
        let rows = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT tenant_id, resource_kind, holder_id, acquired_at, expires_at, version
            FROM tenant_locks
            WHERE holder_id <> '' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_expired", e))?;

        rows.into_iter().map(LockRecord::try_from).collect()
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn reap_expired(&self, key: &LockKey, now: DateTime<Utc>) -> Result<bool, LockError> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_locks
            SET holder_id = '', expires_at = acquired_at
            WHERE tenant_id = $1 AND resource_kind = $2 AND holder_id <> '' AND expires_at <= $3
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.resource.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, FromRow)]
struct LockRow {
    tenant_id: Uuid,
    resource_kind: String,
    holder_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<LockRow> for LockRecord {
    type Error = LockError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        let resource = ResourceKind::from_str(&row.resource_kind)
            .map_err(|e| LockError::Storage(format!("corrupt tenant_locks row: {e}")))?;
        Ok(LockRecord {
            key: LockKey::new(TenantId::from_uuid(row.tenant_id), resource),
            holder: HolderId::from_string(row.holder_id),
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            version: row.version.max(0) as u64,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => LockError::Unavailable(msg),
        SqlFailure::Conflict(msg) | SqlFailure::Invalid(msg) => LockError::Storage(msg),
    }
}
