mod api;
mod auth;
mod config;
mod hooks;
mod logging;
mod pathguard;
mod pipeline;
mod resumables;
mod staging;
mod tenant;

use anyhow::{Context, Result};
use api::{AppState, create_router};
use clap::Parser;
use config::ServerConfig;
use logging::LogConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Multi-tenant HTTP API for streaming file uploads and exports
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // a config the process cannot parse is fatal before anything starts
    let config = Arc::new(ServerConfig::load(&cli.config)?);

    // Keep the guard alive for the entire application lifetime
    let _log_guard = logging::init_logging(LogConfig::new(config.log_dir.clone(), config.debug))
        .context("Failed to initialize logging system")?;

    tracing::info!(
        target: "main",
        config = %cli.config.display(),
        backends = config.backends.disk.len(),
        "Starting file transfer service"
    );

    let state = AppState::new(config.clone()).context("Failed to build application state")?;
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(target: "main", "HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!(target: "main", "Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "main", "Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        },
    }
    tracing::info!(target: "main", "Shutting down gracefully...");
}
