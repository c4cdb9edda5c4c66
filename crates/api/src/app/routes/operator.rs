use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use tenantflow_infra::operator::RunParams;

use crate::app::dto;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/run", post(run))
        .route("/trigger", post(trigger))
}

/// One sweep with caller-supplied caps (defaults from config).
pub async fn run(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::OperatorRunRequest>>,
) -> axum::response::Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let defaults = services.operator.default_params();
    let params = RunParams {
        max_signals: body.max_signals.unwrap_or(defaults.max_signals).min(dto::MAX_LIMIT),
        max_actions: body.max_actions.unwrap_or(defaults.max_actions).min(dto::MAX_LIMIT),
    };
    let report = services.operator.run(params).await;
    (StatusCode::OK, Json(report)).into_response()
}

/// Debounced sweep; `ran = false` when another trigger ran recently.
pub async fn trigger(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let body = match services.operator.trigger_opportunistic().await {
        Some(report) => serde_json::json!({ "ran": true, "report": report }),
        None => serde_json::json!({ "ran": false }),
    };
    (StatusCode::OK, Json(body)).into_response()
}
