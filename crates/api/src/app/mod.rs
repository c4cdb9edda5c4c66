//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store and collaborator wiring
//! - `steps.rs`: the default provisioning pipeline
//! - `scheduler.rs`: periodic batches and sweeps
//! - `routes/`: HTTP handlers, one file per area
//! - `dto.rs` / `errors.rs`: request bodies and consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod scheduler;
pub mod services;
pub mod steps;

pub use services::{AppServices, build_in_memory_services, build_services};

/// Build the full HTTP router around already-wired services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let auth = middleware::AdminAuth::new(services.settings.admin_token.clone());
    if auth.token.is_none() {
        tracing::warn!("TENANTFLOW_ADMIN_TOKEN not set; admin routes will reject every request");
    }

    // Admin routes: bearer token required.
    let admin = routes::admin_router().layer(axum::middleware::from_fn_with_state(
        auth,
        middleware::admin_auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/status", get(routes::system::status))
        .merge(routes::webhook_router())
        .merge(admin)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
