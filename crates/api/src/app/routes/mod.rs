use axum::Router;

pub mod jobs;
pub mod operator;
pub mod system;
pub mod tenants;
pub mod webhooks;

/// Router for operator/admin endpoints (bearer-token protected).
pub fn admin_router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/tenants", tenants::router())
        .nest("/operator", operator::router())
}

/// Router for provider callbacks. Authenticated by signature, not token.
pub fn webhook_router() -> Router {
    Router::new().nest("/webhooks", webhooks::router())
}
