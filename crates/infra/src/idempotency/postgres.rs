//! Postgres-backed webhook ledger.
//!
//! The claim is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE ..
//! RETURNING` statement: Postgres serializes concurrent upserts on the primary
//! key, so exactly one caller sees a returned row. A caller that gets no row
//! reads the existing record to learn why.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use tenantflow_core::TenantId;
use tenantflow_events::{Provider, WebhookEvent, WebhookKey, WebhookStatus};

use super::IdempotencyError;
use super::store::{
    ClaimOutcome, ClaimRequest, FailureDisposition, PROCESSING_TIMEOUT_ERROR, TenantFailureCount,
    WebhookEventFilter, WebhookEventStore, classify_existing,
};
use crate::postgres::{SqlFailure, classify};

const COLUMNS: &str = "source, external_id, workspace_id, status, attempts, max_attempts, \
                       payload, payload_hash, error, created_at, updated_at, processed_at";

#[derive(Debug, Clone)]
pub struct PostgresWebhookEventStore {
    pool: Arc<PgPool>,
}

impl PostgresWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch(&self, key: &WebhookKey) -> Result<Option<WebhookEvent>, IdempotencyError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM webhook_events WHERE source = $1 AND external_id = $2"
        );
        let row = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(key.source.as_str())
            .bind(&key.external_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(WebhookEvent::try_from).transpose()
    }
}

#[async_trait]
impl WebhookEventStore for PostgresWebhookEventStore {
    #[instrument(skip(self, request), fields(key = %request.key), err)]
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, IdempotencyError> {
        let sql = format!(
            r#"
            INSERT INTO webhook_events
                (source, external_id, workspace_id, status, attempts, max_attempts,
                 payload, payload_hash, created_at, updated_at)
            VALUES ($1, $2, $3, 'processing', 1, $4, $5, $6, $7, $7)
            ON CONFLICT (source, external_id) DO UPDATE
            SET status = 'processing',
                attempts = webhook_events.attempts + 1,
                workspace_id = COALESCE(webhook_events.workspace_id, EXCLUDED.workspace_id),
                updated_at = EXCLUDED.updated_at
            WHERE webhook_events.attempts < webhook_events.max_attempts
              AND (webhook_events.status = 'pending'
                   OR (webhook_events.status = 'processing'
                       AND webhook_events.updated_at <= $8))
            RETURNING {COLUMNS}
            "#
        );

        let claimed = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(request.key.source.as_str())
            .bind(&request.key.external_id)
            .bind(request.workspace_id.map(|t| *t.as_uuid()))
            .bind(request.max_attempts as i32)
            .bind(&request.payload)
            .bind(&request.payload_hash)
            .bind(request.now)
            .bind(request.stale_before)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(row.try_into()?));
        }

        // A stale claim on the last allowed attempt can never be reclaimed.
        let timeout_sql = format!(
            r#"
            UPDATE webhook_events
            SET status = 'failed', error = $3, updated_at = $4
            WHERE source = $1 AND external_id = $2
              AND status = 'processing'
              AND attempts >= max_attempts
              AND updated_at <= $5
            RETURNING {COLUMNS}
            "#
        );
        let timed_out = sqlx::query_as::<_, WebhookEventRow>(&timeout_sql)
            .bind(request.key.source.as_str())
            .bind(&request.key.external_id)
            .bind(PROCESSING_TIMEOUT_ERROR)
            .bind(request.now)
            .bind(request.stale_before)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("expire_claim", e))?;

        if let Some(row) = timed_out {
            return Ok(ClaimOutcome::Exhausted(row.try_into()?));
        }

        let existing = self.fetch(&request.key).await?.ok_or_else(|| {
            IdempotencyError::Storage(format!(
                "claim for {} returned no row and no record exists",
                request.key
            ))
        })?;
        Ok(classify_existing(&existing, request.stale_before))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn complete(
        &self,
        key: &WebhookKey,
        now: DateTime<Utc>,
    ) -> Result<bool, IdempotencyError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'completed', error = NULL, updated_at = $3, processed_at = $3
            WHERE source = $1 AND external_id = $2 AND status = 'processing'
            "#,
        )
        .bind(key.source.as_str())
        .bind(&key.external_id)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(key = %key, ?disposition), err)]
    async fn fail(
        &self,
        key: &WebhookKey,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<WebhookEvent, IdempotencyError> {
        let sql = format!(
            r#"
            UPDATE webhook_events
            SET attempts = CASE WHEN $3 THEN GREATEST(attempts, max_attempts) ELSE attempts END,
                status = CASE
                    WHEN $3 OR attempts >= max_attempts THEN 'failed'
                    ELSE 'pending'
                END,
                error = $4,
                updated_at = $5
            WHERE source = $1 AND external_id = $2 AND status = 'processing'
            RETURNING {COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(key.source.as_str())
            .bind(&key.external_id)
            .bind(disposition == FailureDisposition::Abandon)
            .bind(error)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;

        match updated {
            Some(row) => row.try_into(),
            None => self
                .fetch(key)
                .await?
                .ok_or_else(|| IdempotencyError::NotFound(key.clone())),
        }
    }

    async fn get(&self, key: &WebhookKey) -> Result<Option<WebhookEvent>, IdempotencyError> {
        self.fetch(key).await
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &WebhookEventFilter,
    ) -> Result<Vec<WebhookEvent>, IdempotencyError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM webhook_events
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source = $2)
              AND ($3::uuid IS NULL OR workspace_id = $3)
            ORDER BY updated_at DESC
            LIMIT $4
            "#
        );
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.source.map(|s| s.as_str()))
            .bind(filter.workspace_id.map(|t| *t.as_uuid()))
            .bind(limit)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.into_iter().map(WebhookEvent::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn failure_counts(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TenantFailureCount>, IdempotencyError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT workspace_id, COUNT(*)
            FROM webhook_events
            WHERE status = 'failed' AND workspace_id IS NOT NULL AND updated_at >= $1
            GROUP BY workspace_id
            ORDER BY COUNT(*) DESC, workspace_id
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("failure_counts", e))?;

        Ok(rows
            .into_iter()
            .map(|(tenant, failures)| TenantFailureCount {
                tenant_id: TenantId::from_uuid(tenant),
                failures: failures.max(0) as u64,
            })
            .collect())
    }
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    source: String,
    external_id: String,
    workspace_id: Option<Uuid>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    payload: serde_json::Value,
    payload_hash: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = IdempotencyError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        let corrupt = |e: tenantflow_core::DomainError| {
            IdempotencyError::Storage(format!("corrupt webhook_events row: {e}"))
        };
        let source = Provider::from_str(&row.source).map_err(corrupt)?;
        Ok(WebhookEvent {
            key: WebhookKey::new(source, row.external_id).map_err(corrupt)?,
            workspace_id: row.workspace_id.map(TenantId::from_uuid),
            status: WebhookStatus::parse(&row.status).map_err(corrupt)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            payload: row.payload,
            payload_hash: row.payload_hash,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IdempotencyError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => IdempotencyError::Unavailable(msg),
        SqlFailure::Conflict(msg) | SqlFailure::Invalid(msg) => IdempotencyError::Storage(msg),
    }
}
