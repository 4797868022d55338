//! Liveness and error-monitor endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use donorflow_notify::ledger::ERROR_MONITOR_WINDOW_MINUTES;

use crate::state::AppState;

/// Liveness probe.
pub async fn alive() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

/// Uptime-monitor endpoint.
///
/// Answers 500 when any notification attempt failed within the window, so a
/// dumb HTTP monitor pointed here pages someone about silent email failures.
pub async fn error_monitor(State(state): State<AppState>) -> impl IntoResponse {
    match state
        .notifications
        .ledger
        .latest_failure_within_minutes(ERROR_MONITOR_WINDOW_MINUTES)
        .await
    {
        Ok(None) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Ok(Some(record)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "kind": record.event_kind,
                "detail": record.detail,
                "at": record.created_at.to_string(),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Error-monitor ledger query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "detail": "ledger unavailable" })),
            )
        }
    }
}
