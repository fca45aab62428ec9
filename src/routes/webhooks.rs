use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Router};

use crate::services::webhooks::WebhookService;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/calendar", post(handle_calendar_webhook))
}

/// Acknowledge right away and process in the background. The provider only
/// cares about the status code; failures are logged, never returned.
async fn handle_calendar_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> StatusCode {
    let notification = WebhookService::extract_headers(&headers);

    tracing::info!(
        "Received calendar push: state={:?}, channel={:?}, message_number={:?}, expiration={:?}",
        notification.resource_state,
        notification.channel_id,
        notification.message_number,
        notification.expiration
    );

    tokio::spawn(WebhookService::process(state, notification));

    StatusCode::OK
}
