use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use tenantflow_infra::jobs::{EngineError, JobStoreError};
use tenantflow_infra::lock::LockError;
use tenantflow_infra::rate_limit::RateLimitError;
use tenantflow_infra::webhooks::ResolveError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Store(JobStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        EngineError::Store(e @ JobStoreError::Conflict { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        EngineError::Store(JobStoreError::Unavailable(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        EngineError::Store(JobStoreError::Storage(msg)) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        EngineError::Lock(e) => lock_error_to_response(e),
    }
}

pub fn lock_error_to_response(err: LockError) -> axum::response::Response {
    match err {
        LockError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "lock_store_unavailable", msg)
        }
        LockError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "lock_store_error", msg),
    }
}

pub fn rate_limit_error_to_response(err: RateLimitError) -> axum::response::Response {
    match err {
        RateLimitError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "counter_store_unavailable", msg)
        }
        RateLimitError::Storage(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "counter_store_error", msg)
        }
    }
}

pub fn resolve_error_to_response(err: ResolveError) -> axum::response::Response {
    match err {
        ResolveError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "directory_unavailable", msg)
        }
        ResolveError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "directory_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path or query segment, mapping failure to `400 {code}`.
pub fn parse_param<T>(raw: &str, code: &'static str) -> Result<T, axum::response::Response>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, code, e.to_string()))
}
