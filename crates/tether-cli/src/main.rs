//! Tether CLI: registers the demo tool with a local host and serves its calls.

mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::sync::Arc;
use tether_config::{DEFAULT_LOG_LEVEL, EndpointSource, TetherConfig};
use tether_link::Controller;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "tether",
    about = "Expose a local tool to a host agent server over a reverse connection"
)]
struct Cli {
    /// Log the process id at startup so the process can be stopped with `kill`
    #[arg(long)]
    background: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A config that fails to load still gets logged at the default level.
    let config = TetherConfig::load();
    let log_level = config
        .as_ref()
        .map(|c| c.log_level.as_str())
        .unwrap_or(DEFAULT_LOG_LEVEL);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = config.context("Failed to load configuration")?;

    if cli.background {
        let pid = std::process::id();
        tracing::info!("Running in background mode (pid {pid}); stop with: kill {pid}");
    }

    match &config.endpoint {
        EndpointSource::Static(server) => {
            tracing::info!("Using configured host endpoint {}", server.endpoint_url)
        }
        EndpointSource::Manifest { path: Some(path), .. } => {
            tracing::info!("Discovering host via manifest {}", path.display())
        }
        EndpointSource::Manifest { name, .. } => {
            tracing::info!("Discovering host via installed manifest {name}")
        }
    }

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let handler = Arc::new(demo::DemoHandler::new(&config.tool));
    let controller = Controller::new(config.endpoint.discovery(), handler, config.link.clone());
    controller.run(cancel).await;

    tracing::info!("Shut down cleanly");
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown requested");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {e}");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    ctrl_c().await;
}

/// Resolve on Ctrl+C. Never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}
