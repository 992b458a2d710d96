use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{GatewayConfig, LogFormat, LoggingConfig, StoreBackend, StoreConfig};
use tollgate::http::{AdmissionState, BypassRules, HttpServer};
use tollgate::ratelimit::{
    AdmissionEngine, CounterStore, MemoryCounterStore, Policy, RedisCounterStore,
};

/// Per-organization admission control gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Misconfiguration must stop the process before it serves anything
    let config = GatewayConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Starting Tollgate admission gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let policy = Policy::from_config(&config.rate_limiting)?;
    let store = connect_store(&config.store).await?;

    let engine = AdmissionEngine::new(store, policy)
        .with_key_prefix(config.rate_limiting.key_prefix.clone())
        .with_timeout(config.store.timeout());
    let state = AdmissionState::new(
        Arc::new(engine),
        BypassRules::from_config(&config.rate_limiting),
    )?;
    info!("Admission engine initialized");

    HttpServer::new(config.server.http_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate admission gateway stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter.as_str()));

    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
    }
}

async fn connect_store(config: &StoreConfig) -> tollgate::error::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisCounterStore::connect(&config.url).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-process counter store; limits are not shared across processes");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
