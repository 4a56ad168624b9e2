//! Expiry Cache - demo host
//!
//! Builds a cache from environment configuration and keeps its reaper running
//! until the process is asked to stop.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use expiry_cache::{CacheFactory, Config, MemoryTable, XxHasher};

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the configured backend through the factory
/// 4. Wait for SIGINT/SIGTERM
/// 5. Stop the reaper and log final statistics
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "expiry_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting expiry cache");

    let config = Config::from_env().context("invalid cache configuration")?;
    info!(
        "Configuration loaded: driver={}, identity={}, default_ttl={:?}, reap_interval={:?}",
        config.driver, config.identity, config.memory.default_ttl, config.memory.reap_interval
    );

    let factory = CacheFactory::new(Arc::new(XxHasher::default()))
        .with_persistence(Arc::new(MemoryTable::new()));
    let cache = factory
        .build::<String, String>(&config)
        .context("failed to build cache backend")?;

    cache.set_on_expired(Arc::new(|key: String| {
        info!("Entry expired: {}", key);
    }));
    info!("Cache ready");

    shutdown_signal().await;

    cache.shutdown().await;
    let stats = serde_json::to_string(&cache.stats())?;
    info!("Final statistics: {}", stats);
    info!("Shutdown complete");

    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
