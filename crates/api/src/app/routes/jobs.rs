use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use tenantflow_core::TenantId;
use tenantflow_infra::jobs::EnqueueRequest;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/provisioning/run", post(run_batch))
        .route("/provisioning/:tenant_id", post(enqueue).get(status))
}

pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
    body: Option<Json<dto::EnqueueJobRequest>>,
) -> axum::response::Response {
    let tenant_id: TenantId = match errors::parse_param(&tenant_id, "invalid_tenant_id") {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let request = EnqueueRequest {
        source: body.source,
        metadata: body.metadata,
    };
    match services.engine.enqueue(tenant_id, request).await {
        Ok(outcome) => {
            let status = if outcome.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id: TenantId = match errors::parse_param(&tenant_id, "invalid_tenant_id") {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match services.engine.status(tenant_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no provisioning job for tenant {tenant_id}"),
        ),
        Err(e) => errors::engine_error_to_response(e),
    }
}

/// One bounded batch, as the scheduler would run it.
pub async fn run_batch(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::RunBatchRequest>>,
) -> axum::response::Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let max_jobs = dto::clamp_limit(body.max_jobs, services.engine.config().batch_size);
    match services.engine.run_batch(max_jobs).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
