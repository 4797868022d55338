//! Checkout polling endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::state::AppState;

/// Payment status lookup for checkout widgets.
///
/// The browser polls this after handing the card off to the provider, since
/// the widget never sees the webhook. `found` distinguishes "not arrived
/// yet" from "arrived but unsuccessful".
pub async fn poll_payment_intent(
    State(state): State<AppState>,
    Path(intent_id): Path<String>,
) -> impl IntoResponse {
    match state.notifications.ledger.payment_intent_status(&intent_id).await {
        Ok(Some(status)) => (
            StatusCode::OK,
            Json(json!({ "found": true, "successful": status == "succeeded" })),
        ),
        Ok(None) => (
            StatusCode::OK,
            Json(json!({ "found": false, "successful": false })),
        ),
        Err(e) => {
            tracing::error!(intent_id = %intent_id, error = %e, "Payment intent lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "lookup failed" })),
            )
        }
    }
}
