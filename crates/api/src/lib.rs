// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Donorflow API Library
//!
//! HTTP surface of the notification service: webhook intake plus a few
//! operational endpoints for uptime monitoring and checkout polling.

pub mod config;
pub mod routes;
pub mod state;

pub use config::Config;
pub use state::AppState;
