use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Liveness plus in-process counters.
pub async fn status(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "time": services.clock.now(),
        "held_locks": services.locks.held_count(),
        "pending_follow_ups": services.follow_ups.pending_count(),
        "persistent": services.settings.storage.persistent,
    }))
}
