//! Orderflow Indexer binary.
//!
//! Entry point for the sync poller and the indexer job workers.

use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use orderflow_indexer::{IndexerConfig, IndexerService};
use orderflow_jobs::RuntimeConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight jobs get to finish after a stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orderflow_indexer=debug,orderflow_jobs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = IndexerConfig::from_env().context("invalid indexer configuration")?;
    let runtime_config = RuntimeConfig::from_env().context("invalid job runtime configuration")?;

    tracing::info!("Starting Orderflow Indexer");
    tracing::info!("Chain id: {}", config.chain_id);
    tracing::info!("RPC URL: {}", config.rpc_url);
    tracing::info!("Redis URL: {}", runtime_config.redis_url);

    let service = IndexerService::connect(config, runtime_config)
        .await
        .context("failed to assemble indexer")?;
    let tasks = service.start().await.context("failed to start indexer")?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down indexer");
    service.stop();

    // Dead-letter sweeps only see the stop on their next tick.
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks)).await.is_err() {
        tracing::warn!("shutdown grace period elapsed with tasks still running");
    }

    Ok(())
}
