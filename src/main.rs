use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::{BackendKind, LogFormat, LoggingConfig, TurnstileConfig};
use turnstile::http::{HttpServer, RateLimitState};
use turnstile::ratelimit::{PolicyRules, RateLimiter};
use turnstile::storage::select_backend;

/// Fixed-window rate limiting gateway.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Storage backend, overriding the configuration
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.listen {
        config.server.http_addr = addr;
    }
    if let Some(backend) = args.backend {
        config.storage.backend = backend;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile rate limiting gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let storage = select_backend(&config.storage).await?;
    let rate_limiter = Arc::new(RateLimiter::new(storage));
    info!(storage = rate_limiter.storage().name(), "Rate limiter initialized");

    PolicyRules::from_config(&config.rate_limiting).log_summary();

    let state = RateLimitState::from_config(rate_limiter.clone(), &config)?;
    let server = HttpServer::new(config.server.http_addr, state);

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    if let Err(e) = rate_limiter.close().await {
        error!(error = %e, "Error closing storage");
    }
    served?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
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
