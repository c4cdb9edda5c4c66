//! Postgres-backed provisioning job store.
//!
//! "At most one active job per workspace" is enforced by the partial unique
//! index `provisioning_jobs_active_workspace_idx`; `create_if_absent` inserts
//! with `ON CONFLICT DO NOTHING` against it and falls back to reading the
//! winner. Updates are guarded by the `version` column.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{instrument, warn};
use uuid::Uuid;

use tenantflow_core::{ExpectedVersion, JobId, TenantId};

use super::store::{JobStore, JobStoreError};
use super::types::{JobOutputs, JobSource, JobStats, JobStatus, ProvisioningJob};
use crate::postgres::{SqlFailure, classify};

const COLUMNS: &str = "id, workspace_id, status, progress, completed_steps, result, error, \
                       source, metadata, step_failures, version, created_at, updated_at, completed_at";

/// Attempts to either insert or observe an active job before giving up. A
/// miss on both sides means the active job finished in between.
const CREATE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn active_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<ProvisioningJob>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM provisioning_jobs \
             WHERE workspace_id = $1 AND status IN ('pending', 'in_progress')"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("active_for_tenant", e))?;
        row.map(ProvisioningJob::try_from).transpose()
    }

    async fn fetch_many(
        &self,
        operation: &str,
        query: sqlx::query::QueryAs<'_, sqlx::Postgres, JobRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.into_iter().map(ProvisioningJob::try_from).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(tenant_id = %job.workspace_id, job_id = %job.id), err)]
    async fn create_if_absent(
        &self,
        job: ProvisioningJob,
    ) -> Result<(ProvisioningJob, bool), JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO provisioning_jobs ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1, $11, $12, $13)
            ON CONFLICT (workspace_id) WHERE status IN ('pending', 'in_progress') DO NOTHING
            RETURNING {COLUMNS}
            "#
        );

        for _ in 0..CREATE_ATTEMPTS {
            let inserted = sqlx::query_as::<_, JobRow>(&sql)
                .bind(job.id.as_uuid())
                .bind(job.workspace_id.as_uuid())
                .bind(job.status.as_str())
                .bind(job.progress as i16)
                .bind(Json(&job.completed_steps))
                .bind(Json(&job.result))
                .bind(&job.error)
                .bind(job.source.as_str())
                .bind(&job.metadata)
                .bind(job.step_failures as i32)
                .bind(job.created_at)
                .bind(job.updated_at)
                .bind(job.completed_at)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_if_absent", e))?;

            if let Some(row) = inserted {
                return Ok((row.try_into()?, true));
            }
            if let Some(active) = self.active_for_tenant(job.workspace_id).await? {
                return Ok((active, false));
            }
            warn!(tenant_id = %job.workspace_id, "active job vanished during enqueue, retrying");
        }

        Err(JobStoreError::Storage(format!(
            "could not enqueue job for {} after {CREATE_ATTEMPTS} attempts",
            job.workspace_id
        )))
    }

    async fn get(&self, id: JobId) -> Result<Option<ProvisioningJob>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM provisioning_jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(ProvisioningJob::try_from).transpose()
    }

    async fn latest_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Option<ProvisioningJob>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM provisioning_jobs WHERE workspace_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_for_tenant", e))?;
        row.map(ProvisioningJob::try_from).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_runnable(&self, limit: usize) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM provisioning_jobs \
             WHERE status IN ('pending', 'in_progress') \
             ORDER BY (status = 'in_progress') DESC, created_at ASC, id ASC \
             LIMIT $1"
        );
        self.fetch_many(
            "list_runnable",
            sqlx::query_as::<_, JobRow>(&sql).bind(limit as i64),
        )
        .await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, expected = ?expected), err)]
    async fn update(
        &self,
        job: &ProvisioningJob,
        expected: ExpectedVersion,
    ) -> Result<ProvisioningJob, JobStoreError> {
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let sql = format!(
            r#"
            UPDATE provisioning_jobs
            SET status = $2,
                progress = $3,
                completed_steps = $4,
                result = $5,
                error = $6,
                metadata = $7,
                step_failures = $8,
                updated_at = $9,
                completed_at = $10,
                version = version + 1
            WHERE id = $1 AND ($11::bigint IS NULL OR version = $11)
            RETURNING {COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(job.progress as i16)
            .bind(Json(&job.completed_steps))
            .bind(Json(&job.result))
            .bind(&job.error)
            .bind(&job.metadata)
            .bind(job.step_failures as i32)
            .bind(job.updated_at)
            .bind(job.completed_at)
            .bind(expected_version)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?;

        match updated {
            Some(row) => row.try_into(),
            None => match self.get(job.id).await? {
                Some(current) => Err(JobStoreError::Conflict {
                    id: job.id,
                    expected,
                    actual: current.version,
                }),
                None => Err(JobStoreError::NotFound(job.id)),
            },
        }
    }

    async fn latest_per_tenant(
        &self,
        tenant_id: Option<TenantId>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM (
                SELECT DISTINCT ON (workspace_id) *
                FROM provisioning_jobs
                WHERE ($1::uuid IS NULL OR workspace_id = $1)
                ORDER BY workspace_id, created_at DESC, id DESC
            ) latest
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        self.fetch_many(
            "latest_per_tenant",
            sqlx::query_as::<_, JobRow>(&sql)
                .bind(tenant_id.map(|t| *t.as_uuid()))
                .bind(limit as i64),
        )
        .await
    }

    async fn list_stuck(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM provisioning_jobs \
             WHERE status IN ('pending', 'in_progress') AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        );
        self.fetch_many(
            "list_stuck",
            sqlx::query_as::<_, JobRow>(&sql)
                .bind(idle_since)
                .bind(limit as i64),
        )
        .await
    }

    async fn list_failed_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProvisioningJob>, JobStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM provisioning_jobs \
             WHERE status = 'failed' AND updated_at >= $1 \
             ORDER BY updated_at DESC LIMIT $2"
        );
        self.fetch_many(
            "list_failed_since",
            sqlx::query_as::<_, JobRow>(&sql)
                .bind(since)
                .bind(limit as i64),
        )
        .await
    }

    async fn stats(&self, tenant_id: Option<TenantId>) -> Result<JobStats, JobStoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM provisioning_jobs
            WHERE ($1::uuid IS NULL OR workspace_id = $1)
            GROUP BY status
            "#,
        )
        .bind(tenant_id.map(|t| *t.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            let status = JobStatus::parse(&status)
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    workspace_id: Uuid,
    status: String,
    progress: i16,
    completed_steps: Json<Vec<String>>,
    result: Json<JobOutputs>,
    error: Option<String>,
    source: String,
    metadata: serde_json::Value,
    step_failures: i32,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ProvisioningJob {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt =
            |e: tenantflow_core::DomainError| JobStoreError::Storage(format!("corrupt job row: {e}"));
        Ok(ProvisioningJob {
            id: JobId::from_uuid(row.id),
            workspace_id: TenantId::from_uuid(row.workspace_id),
            status: JobStatus::parse(&row.status).map_err(corrupt)?,
            progress: row.progress.clamp(0, 100) as u8,
            completed_steps: row.completed_steps.0,
            result: row.result.0,
            error: row.error,
            source: JobSource::parse(&row.source).map_err(corrupt)?,
            metadata: row.metadata,
            step_failures: row.step_failures.max(0) as u32,
            version: row.version.max(0) as u64,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => JobStoreError::Unavailable(msg),
        SqlFailure::Conflict(msg) | SqlFailure::Invalid(msg) => JobStoreError::Storage(msg),
    }
}
