//! Switchyard reverse proxy
//!
//! Usage:
//! ```bash
//! # Serve a static program on the default listener (0.0.0.0:9999)
//! SWITCHYARD_LISTEN=127.0.0.1:8080 switchyard
//!
//! # With a config file; env vars and flags override it
//! switchyard --config switchyard.yaml --log-level debug
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use switchyard_observability::logging;
use switchyard_server::{App, ServerConfig};
use tracing::{error, info};

/// Switchyard - HTTP reverse proxy and TCP+SNI router
#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "HTTP reverse proxy and TCP+SNI router driven by route programs", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, value_name = "FILE", env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Address of the HTTP listener, replacing the configured one
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.merge_env();
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(addr) = &cli.listen {
        config.set_listen(addr);
    }
    config.validate()?;

    logging::init(&config.logging).context("Failed to initialize logging")?;

    info!("🚀 Starting switchyard");
    if let Some(path) = &cli.config {
        info!("   Config: {}", path.display());
    }
    for listener in &config.listeners {
        info!("   Listener: {} ({})", listener.addr, listener.proto);
    }
    info!("   Strategy: {:?}, matcher: {:?}", config.proxy.strategy, config.proxy.matcher);
    if config.admin.enabled {
        info!("   Admin: http://{}/api/routes", config.admin.addr);
    }

    let app = match App::build(config) {
        Ok(app) => app.bind().await,
        Err(e) => Err(e),
    };
    let app = match app {
        Ok(app) => app,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return Err(e);
        }
    };

    app.serve(shutdown_signal()).await
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
