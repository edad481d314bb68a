//! Process configuration loaded from environment variables. `WEBHOOK_*`
//! credentials are passed through verbatim to the webhook sink; the engine
//! itself reads nothing else.

use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub catalog_path: String,
    pub tick_interval: Duration,
    /// Base URL the webhook sink posts `deliver()` payloads to.
    pub webhook_url: Option<String>,
    /// Bearer token forwarded as `Authorization` on webhook deliveries.
    pub webhook_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables, loading a `.env` file
    /// first if present (development convenience).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid number")?;

        let catalog_path = std::env::var("CATALOG_PATH").unwrap_or_else(|_| "tasks.yaml".to_string());

        let tick_interval_ms: u64 = std::env::var("TICK_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .context("TICK_INTERVAL_MS must be a valid number")?;

        Ok(Self {
            port,
            catalog_path,
            tick_interval: Duration::from_millis(tick_interval_ms),
            webhook_url: std::env::var("WEBHOOK_URL").ok(),
            webhook_token: std::env::var("WEBHOOK_TOKEN").ok(),
        })
    }
}
