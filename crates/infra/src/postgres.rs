//! Shared Postgres plumbing for the durable stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | `SqlFailure` |
//! |------------|----------------------|--------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Invalid` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Invalid` |
//!
//! Each store maps `SqlFailure` onto its own error type; `Unavailable` is what
//! callers treat as the "store down" infrastructure failure.

use sqlx::PgPool;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_orchestration.sql");

/// Create the orchestration tables if they do not exist.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("orchestration schema applied");
    Ok(())
}

/// Storage-agnostic classification of a SQLx failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SqlFailure {
    Conflict(String),
    Unavailable(String),
    Invalid(String),
}

pub(crate) fn classify(operation: &str, err: sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SqlFailure::Conflict(msg),
                _ => SqlFailure::Invalid(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            SqlFailure::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => SqlFailure::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => SqlFailure::Unavailable(format!("tls error in {operation}: {e}")),
        other => SqlFailure::Invalid(format!("sqlx error in {operation}: {other}")),
    }
}
