//! Payment-provider webhook intake.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use donorflow_notify::NotifyError;

use crate::state::AppState;

/// Receive one webhook delivery.
///
/// Verified events are always acknowledged with `{"received": true}` no
/// matter how processing goes; a non-2xx answer would only make the provider
/// redeliver an event we already know how to handle or skip. The single
/// exception is a payload that fails verification, which earns a 400.
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let event = match state.notifications.webhooks.verify_and_parse(&body, signature) {
        Ok(event) => event,
        Err(NotifyError::WebhookSignatureInvalid) => {
            tracing::warn!("Rejected webhook with invalid signature");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid signature" })),
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected malformed webhook payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "malformed payload" })),
            );
        }
    };

    tracing::info!(
        event_type = %event.event_type,
        event_id = %event.id,
        "Webhook received"
    );

    if let Err(e) = state.notifications.webhooks.process_event(&event).await {
        // Still acknowledged: the failure is recorded and the error monitor
        // picks it up, redelivery would not help.
        tracing::error!(
            event_type = %event.event_type,
            event_id = %event.id,
            error = %e,
            "Webhook processing failed"
        );
    }

    (StatusCode::OK, Json(json!({ "received": true })))
}
