//! plaincli - command execution server
//!
//! Accepts framed CLI sessions over TCP and runs the builtin command set.

use plaincli_server::{Builtins, Config, Server, ServerError};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if PLAINCLI_CONFIG is set, then env overrides)
    let config_path = std::env::var("PLAINCLI_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration ({})", e);
            Config::default()
        }
    };

    tracing::info!("Starting plaincli server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    match config.session.start_timeout() {
        Some(timeout) => tracing::info!("  Start timeout: {:?}", timeout),
        None => tracing::info!("  Start timeout: disabled"),
    }

    let server = Arc::new(Server::new(config.server_config(), Arc::new(Builtins)));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} failed sessions)",
        stats
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed),
        stats
            .sessions_failed
            .load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}
