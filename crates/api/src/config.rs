//! Environment-driven configuration for the API server.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds, e.g. `0.0.0.0:8080`
    pub bind_address: String,
    /// Postgres connection string
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        Ok(Self {
            bind_address,
            database_url,
        })
    }
}
