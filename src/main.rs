//! # Sparrow Gateway - Main Entry Point
//!
//! Loads configuration, installs logging and metrics, wires the dispatcher
//! and serves until SIGTERM or SIGINT.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use sparrow_gateway::core::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use sparrow_gateway::gateway::server::{build_router, serve, ServerState};
use sparrow_gateway::observability::{init_tracing, install_prometheus_recorder};
use sparrow_gateway::{GatewayConfig, GatewayDispatcher, GatewayError, GatewayResult};

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match GatewayConfig::load_from_file(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging)?;

    info!("🚀 Starting {}", config.service.name);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("📋 Configuration loaded from {}", config_path);

    if let Err(e) = run(config).await {
        error!("Gateway terminated with error: {}", e);
        std::process::exit(1);
    }

    info!("✅ Gateway shutdown complete");
    Ok(())
}

async fn run(config: GatewayConfig) -> GatewayResult<()> {
    let prometheus = install_prometheus_recorder()?;
    info!("📊 Metrics recorder installed");

    let dispatcher = Arc::new(GatewayDispatcher::from_config(&config)?);
    info!(
        policies = dispatcher.policies().len(),
        routes = dispatcher.routes().routes().len(),
        "🛣️  Dispatcher ready"
    );
    if config.rate_limiting.is_none() {
        warn!("⚠️  Rate limiting disabled");
    }

    let state = ServerState::new(Arc::clone(&dispatcher), &config).with_prometheus(prometheus);
    let app = build_router(state, &config);

    let address = config.listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| GatewayError::internal(format!("Failed to bind gateway server to {}: {}", address, e)))?;

    serve(listener, app, shutdown_signal()).await
}

/// Resolves on the first SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
        info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown...");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
        info!("📡 Received SIGTERM, initiating graceful shutdown...");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("⏳ Waiting for in-flight requests to complete...");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        warn!("⚠️  Server shutdown timed out after 30s, forcing shutdown");
        std::process::exit(0);
    });
}
