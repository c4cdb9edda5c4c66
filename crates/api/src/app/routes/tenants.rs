use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};

use tenantflow_core::TenantId;
use tenantflow_infra::lock::ResourceKind;
use tenantflow_infra::rate_limit::ResourceClass;
use tenantflow_infra::webhooks::{TenantDirectory, TenantLookup};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/:tenant_id/budget", get(budget))
        .route("/:tenant_id/budget/:class/reset", post(reset_budget))
        .route("/:tenant_id/lookups", post(register_lookup))
        .route("/:tenant_id/locks/:resource", delete(force_release_lock))
}

fn tenant(raw: &str) -> Result<TenantId, axum::response::Response> {
    errors::parse_param(raw, "invalid_tenant_id")
}

/// `GET /tenants/health?tenant_id=&limit=`
pub async fn health(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::HealthQuery>,
) -> axum::response::Response {
    let tenant_id = match query.tenant_id.as_deref().map(tenant).transpose() {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let limit = dto::clamp_limit(query.limit, 50);
    match services.engine.health(tenant_id, limit).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn budget(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id = match tenant(&tenant_id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match services.limiter.get_stats(tenant_id).await {
        Ok(classes) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "tenant_id": tenant_id,
                "classes": classes,
            })),
        )
            .into_response(),
        Err(e) => errors::rate_limit_error_to_response(e),
    }
}

pub async fn reset_budget(
    Extension(services): Extension<Arc<AppServices>>,
    Path((tenant_id, class)): Path<(String, String)>,
) -> axum::response::Response {
    let tenant_id = match tenant(&tenant_id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let class: ResourceClass = match errors::parse_param(&class, "invalid_resource_class") {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match services.limiter.reset(tenant_id, class).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => errors::rate_limit_error_to_response(e),
    }
}

/// Point a provider identifier at this tenant, e.g.
/// `{"kind": "stripe_customer", "value": "cus_123"}`.
pub async fn register_lookup(
    Extension(services): Extension<Arc<AppServices>>,
    Path(tenant_id): Path<String>,
    Json(lookup): Json<TenantLookup>,
) -> axum::response::Response {
    let tenant_id = match tenant(&tenant_id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    if lookup.value().trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_lookup", "lookup value is empty");
    }
    match services.directory.register(lookup.clone(), tenant_id).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "tenant_id": tenant_id,
                "lookup": lookup.normalized(),
            })),
        )
            .into_response(),
        Err(e) => errors::resolve_error_to_response(e),
    }
}

/// Evict the holder of a tenant lock. Returns the evicted record.
pub async fn force_release_lock(
    Extension(services): Extension<Arc<AppServices>>,
    Path((tenant_id, resource)): Path<(String, String)>,
) -> axum::response::Response {
    let tenant_id = match tenant(&tenant_id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let resource: ResourceKind = match errors::parse_param(&resource, "invalid_resource") {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match services.locks.force_release(tenant_id, resource).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "lock is not held"),
        Err(e) => errors::lock_error_to_response(e),
    }
}
