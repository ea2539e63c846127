//! # Beacon Server
//!
//! Reference WebSocket server for the Beacon presence and delivery engine.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon
//!
//! # Run with custom config
//! beacon --config /path/to/beacon.toml
//!
//! # Run with environment variables
//! BEACON_PORT=8080 BEACON_HOST=0.0.0.0 beacon
//!
//! # Join a fleet (requires the `redis` feature)
//! BEACON_CACHE__BACKEND=redis BEACON_CACHE__URL=redis://cache:6379/ beacon
//! ```

mod config;
mod handlers;
mod metrics;
mod topics;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tenvis_beacon_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (Some(flag), _) => anyhow::bail!("Unknown argument: {flag}"),
        (None, _) => config::Config::load().context("Failed to load configuration")?,
    };

    tracing::info!("Starting Beacon server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
