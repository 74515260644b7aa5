//! # Parlor Server
//!
//! Realtime chat presence and room session server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parlor
//!
//! # Run with a custom config file
//! PARLOR_CONFIG=/path/to/parlor.toml parlor
//!
//! # Run with environment variables
//! PARLOR_PORT=8080 PARLOR_HOST=0.0.0.0 parlor
//! PARLOR__CHAT__HISTORY_LIMIT=50 parlor
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use parlor_core::MemoryStorage;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parlor=debug,parlor_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Parlor server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Accounts, history and rooms live in process memory
    let storage = Arc::new(MemoryStorage::new());

    // Start the server
    handlers::run_server(config, storage).await?;

    Ok(())
}
