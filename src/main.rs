//! consul-alerting daemon
//!
//! Run with: consul-alerting [--config <path>]
//!
//! Without a config file the daemon runs with defaults: local node and
//! service watches against the agent at localhost:8500, and a single
//! stdout handler writing alert lines at warning level. `RUST_LOG`
//! overrides the configured log level.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use consul_alerting::config::Config;
use consul_alerting::daemon;
use consul_alerting::health::consul::ConsulHealth;
use consul_alerting::kv::consul::ConsulKv;

/// Exit code for configuration or bootstrap failures.
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(
    name = "consul-alerting",
    about = "Distributed alerting daemon for Consul-backed clusters",
    version
)]
struct Cli {
    /// Path to a configuration file on disk.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => Config::default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(config);
    tracing::info!(address = %config.consul_address, "Using Consul agent");

    let kv = Arc::new(ConsulKv::new(&config.consul_address, &config.consul_token));
    let health = Arc::new(ConsulHealth::new(
        &config.consul_address,
        &config.consul_token,
        config.datacenter.clone(),
    ));

    let daemon = match daemon::start(Arc::clone(&config), kv, health).await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "Error starting daemon");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    wait_for_signal().await;
    tracing::info!("Got interrupt signal, shutting down");
    daemon.shutdown().await;
    ExitCode::SUCCESS
}

/// Block until SIGINT, SIGTERM or SIGQUIT.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "Error installing SIGTERM handler");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "Error installing SIGQUIT handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}
