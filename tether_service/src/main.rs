//! tether tunnel service daemon
//!
//! Listens on a Unix domain socket and drives the tunnel on behalf of the
//! foreground client. Runs until SIGINT or SIGTERM.

use clap::Parser;
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, parse_level, LogOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tether_service::{IpcHandler, TunnelOptions, TunnelSimulator};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Command-line arguments for the service daemon
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the Unix Domain Socket for IPC (overrides the config file)
    #[clap(short, long)]
    socket_path: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[clap(short, long)]
    log_level: Option<String>,

    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config_result = Config::load_or_default(&config_path);
    let config = match &config_result {
        Ok(config) => config.clone(),
        Err(_) => Config::default(),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    let _guard = init_logging(LogOptions {
        level: parse_level(&log_level),
        log_to_file: config.logging.log_to_file,
        log_dir: config.logging.log_dir.clone(),
        log_file_name: "tether-service".to_string(),
        json_format: config.logging.json_format,
        ..Default::default()
    });

    info!("tether service starting up");
    match config_result {
        Ok(_) => info!("Using configuration from {}", config_path.display()),
        Err(e) => {
            warn!(
                "Failed to load configuration from {}: {}",
                config_path.display(),
                e
            );
            warn!("Using default configuration");
        }
    }

    let socket_path = args.socket_path.unwrap_or(config.socket_path.clone());
    debug!("Socket path: {}", socket_path.display());
    if let Some(parent) = socket_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tunnel = TunnelSimulator::new(TunnelOptions {
        connect_delay: config.service.connect_delay(),
        statistics_interval: config.service.statistics_interval(),
    });

    // Create a channel for shutdown signaling
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let ipc_handler = IpcHandler::new(Arc::clone(&tunnel));
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_handler.run(socket_path, shutdown_rx).await {
            error!("Error running IPC handler: {}", e);
        }
    });

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    // Leave no tunnel behind
    tunnel.disconnect();

    if shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal");
    }

    if let Err(e) = ipc_handle.await {
        error!("Error waiting for IPC handler to finish: {}", e);
    }

    info!("tether service shut down");
    Ok(())
}
