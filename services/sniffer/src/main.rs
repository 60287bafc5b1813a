//! Sniffer daemon entry point.
//!
//! `sniffer` runs the daemon; `sniffer --stop` asks a running daemon to
//! shut down through its admin channel and exits 0 when it agreed.

use anyhow::{Context, Result};
use clap::Parser;
use sniffer_daemon::config::{LogFormat, LoggingConfig, SnifferConfig};
use sniffer_daemon::{request_stop, Coordinator, PgConnector};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sniffer", version, about = "802.11 presence ingestion daemon")]
struct Cli {
    /// Configuration file, replacing /etc/sniffer/sniffer.ini
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Ask the running daemon to stop
    #[arg(long)]
    stop: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = SnifferConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;

    if cli.stop {
        return Ok(stop_daemon(&config).await);
    }

    info!(server_id = %config.server.id, "Starting sniffer daemon");

    if let Some(port) = config.metrics.port {
        init_metrics(port)?;
    }

    let connector = PgConnector::new(config.database.clone());
    let coordinator = Coordinator::start(config, Box::new(connector))
        .await
        .context("Failed to start sniffer")?;

    coordinator.run(shutdown_signal()).await;

    info!("Sniffer daemon stopped");
    Ok(ExitCode::SUCCESS)
}

async fn stop_daemon(config: &SnifferConfig) -> ExitCode {
    let Some(license_key) = config.server.license_key.as_deref() else {
        error!("server.license_key must be set to stop the daemon");
        return ExitCode::FAILURE;
    };

    match request_stop(&config.admin, license_key).await {
        Ok(outcome) => {
            info!(outcome = ?outcome, "Daemon answered stop request");
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(e) => {
            error!(error = %e, "Stop request failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging based on configuration.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str().to_lowercase()))?
        .add_directive("sqlx=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => subscriber.with(fmt::layer().json()).init(),
        LogFormat::Pretty => subscriber.with(fmt::layer().pretty()).init(),
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_stop_and_config() {
        let cli = Cli::parse_from(["sniffer", "--stop", "--config", "/tmp/sniffer.ini"]);
        assert!(cli.stop);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/sniffer.ini")));
    }

    #[test]
    fn test_cli_defaults_to_daemon_mode() {
        let cli = Cli::parse_from(["sniffer"]);
        assert!(!cli.stop);
        assert!(cli.config.is_none());
    }
}
