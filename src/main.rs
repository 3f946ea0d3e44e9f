use axum::Router;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::http::HttpServer;
use gatekeeper::ratelimit::{RateLimiter, Sweeper};

/// Per-client admission control in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides configuration)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Bucket capacity per minute (overrides configuration)
    #[arg(long)]
    requests_per_minute: Option<u64>,

    /// Log filter directive, e.g. `debug` or `gatekeeper=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GatekeeperConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.listen {
        config.server.http_addr = addr;
    }
    if let Some(rpm) = cli.requests_per_minute {
        config.rate_limiting.requests_per_minute = rpm;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json_logs;

    init_tracing(&config.logging);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &cli.config {
        info!(path = %path.display(), "Loaded configuration file");
    }
    config.validate()?;
    info!(
        http_addr = %config.server.http_addr,
        requests_per_minute = config.rate_limiting.requests_per_minute,
        block_window_secs = config.rate_limiting.block_window_secs,
        "Configuration loaded"
    );

    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limiting));
    let sweeper = Sweeper::new(rate_limiter.clone(), &config.rate_limiting).spawn();
    info!("Rate limiter initialized");

    let server = HttpServer::new(&config.server, rate_limiter);
    let result = server
        .serve_with_shutdown(Router::new(), shutdown_signal())
        .await;

    sweeper.shutdown().await;
    result?;

    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
