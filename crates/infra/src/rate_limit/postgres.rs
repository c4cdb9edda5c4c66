//! Durable usage log backing rate limits when the fast counter is down.
//!
//! Each call runs in one transaction that takes a transaction-scoped advisory
//! lock on the counter key, prunes events older than the window, counts what
//! remains and inserts the new event when under the cap. Concurrent callers
//! for the same key serialize on the advisory lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use super::store::{CounterKey, CounterStore};
use super::window::WindowState;
use super::RateLimitError;
use crate::postgres::{SqlFailure, classify};

#[derive(Debug, Clone)]
pub struct PostgresUsageLog {
    pool: Arc<PgPool>,
}

impl PostgresUsageLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin_locked(
        &self,
        key: &CounterKey,
    ) -> Result<Transaction<'static, Postgres>, RateLimitError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;
        Ok(tx)
    }

    /// Count and oldest timestamp of the events inside the window.
    async fn window_usage(
        tx: &mut Transaction<'static, Postgres>,
        key: &CounterKey,
        cutoff: DateTime<Utc>,
    ) -> Result<(i64, Option<DateTime<Utc>>), RateLimitError> {
        sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            r#"
            SELECT COUNT(*), MIN(occurred_at)
            FROM usage_log
            WHERE tenant_id = $1 AND resource_class = $2 AND occurred_at > $3
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.class.as_str())
        .bind(cutoff)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("window_usage", e))
    }
}

#[async_trait]
impl CounterStore for PostgresUsageLog {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn try_consume(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        let cutoff = now - window;
        let mut tx = self.begin_locked(key).await?;

        sqlx::query(
            "DELETE FROM usage_log WHERE tenant_id = $1 AND resource_class = $2 AND occurred_at <= $3",
        )
        .bind(key.tenant_id.as_uuid())
        .bind(key.class.as_str())
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("prune", e))?;

        let (count, oldest) = Self::window_usage(&mut tx, key, cutoff).await?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let allowed = count < cap;

        if allowed {
            sqlx::query(
                "INSERT INTO usage_log (tenant_id, resource_class, occurred_at) VALUES ($1, $2, $3)",
            )
            .bind(key.tenant_id.as_uuid())
            .bind(key.class.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        Ok(WindowState {
            allowed,
            count: if allowed { count + 1 } else { count },
            reset_at: oldest.unwrap_or(now) + window,
        })
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        cap: u32,
        now: DateTime<Utc>,
    ) -> Result<WindowState, RateLimitError> {
        let mut tx = self.begin_locked(key).await?;
        let (count, oldest) = Self::window_usage(&mut tx, key, now - window).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        let count = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(WindowState {
            allowed: count < cap,
            count,
            reset_at: oldest.unwrap_or(now) + window,
        })
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn reset(&self, key: &CounterKey) -> Result<(), RateLimitError> {
        sqlx::query("DELETE FROM usage_log WHERE tenant_id = $1 AND resource_class = $2")
            .bind(key.tenant_id.as_uuid())
            .bind(key.class.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RateLimitError {
    match classify(operation, err) {
        SqlFailure::Unavailable(msg) => RateLimitError::Unavailable(msg),
        SqlFailure::Conflict(msg) | SqlFailure::Invalid(msg) => RateLimitError::Storage(msg),
    }
}
