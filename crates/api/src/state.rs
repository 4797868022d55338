//! Application state

use std::sync::Arc;

use donorflow_notify::NotificationService;
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub notifications: Arc<NotificationService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let notifications = NotificationService::from_env(pool.clone())?;

        if notifications.webhooks.crm_enabled() {
            tracing::info!("Salesforce CRM synchronisation enabled");
        } else {
            tracing::warn!("Salesforce credentials not set - CRM pushes disabled");
        }

        Ok(Self {
            pool,
            config,
            notifications: Arc::new(notifications),
        })
    }
}
