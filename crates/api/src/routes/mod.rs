//! HTTP routes

pub mod health;
pub mod payments;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::alive))
        .route("/error-monitor", get(health::error_monitor))
        .route("/poll/payment-intent/{intent_id}", get(payments::poll_payment_intent))
        .route("/webhook", post(webhooks::receive_webhook))
        .with_state(state)
}
