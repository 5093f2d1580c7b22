//! # roomcast server
//!
//! Realtime room fan-out and presence over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Run with a config file
//! ROOMCAST_CONFIG=/path/to/roomcast.toml roomcast
//!
//! # Override single keys from the environment
//! ROOMCAST__PORT=8080 ROOMCAST__HOST=0.0.0.0 roomcast
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "roomcast=debug,roomcast_core=debug,roomcast_transport=debug,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting roomcast server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
