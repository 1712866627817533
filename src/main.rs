//! tollgate - application server request core
//!
//! Serves HTTP/1.x and relay connectors, routes requests by host and path,
//! and enforces security constraints before handlers run.

use std::time::Duration;
use tollgate_server::{Config, Server};
use tracing_subscriber::EnvFilter;

/// How long open connections get to finish after ctrl-c.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TOLLGATE_CONFIG is set, then env overrides)
    let config_path = std::env::var("TOLLGATE_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            match config_path {
                Some(ref path) => tracing::info!("Loaded config from {}", path),
                None => tracing::info!("Using default configuration"),
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    // Load bearer tokens from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }

    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting tollgate");
    for connector in &config.connectors {
        tracing::info!(
            "  Connector {}: {} ({}{})",
            connector.name,
            connector.bind_addr,
            connector.protocol.name(),
            if connector.secure { ", TLS" } else { "" }
        );
    }
    tracing::info!(
        "  Contexts: {}, users: {}, bearer tokens: {}",
        config.contexts.len(),
        config.realm.users.len(),
        config.realm.bearer_tokens.len()
    );
    if config.metrics.enabled {
        tracing::info!("  Metrics: http://{}/metrics", config.metrics.bind_addr);
    } else {
        tracing::info!("  Metrics: disabled");
    }

    let server = Server::from_config(&config)?;
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, closing connectors...");
    let aborted = server.close_graceful(SHUTDOWN_GRACE).await?;
    if aborted > 0 {
        tracing::warn!("{} connections were aborted at the deadline", aborted);
    }

    tracing::info!("Server stopped");
    Ok(())
}
