use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, OriginalUri, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use tenantflow_events::{InboundWebhook, Provider};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:provider", post(receive))
}

/// `POST /webhooks/{provider}`: the status code is the delivery decision.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    Path(provider): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let provider = match provider.parse::<Provider>() {
        Ok(p) => p,
        Err(e) => return errors::json_error(StatusCode::NOT_FOUND, "unknown_provider", e.to_string()),
    };

    let url = public_url(services.settings.public_base_url.as_deref(), &headers, &uri);
    let mut delivery = InboundWebhook::new(provider, url, body.to_vec());
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            delivery = delivery.with_header(name.as_str(), value);
        }
    }

    let ack = services.dispatcher.deliver(&delivery).await;
    let status = StatusCode::from_u16(ack.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ack)).into_response()
}

/// URL the provider called, as it signed it. Twilio signs the full public
/// URL, which a proxy may have rewritten.
fn public_url(base: Option<&str>, headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    let path = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    if let Some(base) = base {
        return format!("{base}{path}");
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let proto = header("x-forwarded-proto").unwrap_or("https");
    let host = header("x-forwarded-host")
        .or_else(|| header("host"))
        .unwrap_or("localhost");
    format!("{proto}://{host}{path}")
}
