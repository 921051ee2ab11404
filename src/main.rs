//! HTLC Relayer - cross-chain atomic swap coordination
//!
//! Monitors HTLC and bridge contracts on two chains and coordinates
//! order fulfillment, secret propagation and timeout refunds.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use htlc_relayer::api;
use htlc_relayer::chain::ChainManager;
use htlc_relayer::config::Settings;
use htlc_relayer::metrics::MetricsServer;
use htlc_relayer::resolver::{OrderStore, Resolver};
use htlc_relayer::state::{PgStateStore, StateStore};
use htlc_relayer::supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting HTLC Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Invalid configuration aborts before any event is handled
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let state_store = Arc::new(PgStateStore::new(&settings.database).await?);
    state_store.run_migrations().await?;
    info!("Database connection established");
    let state_store: Arc<dyn StateStore> = state_store;

    let chains = Arc::new(ChainManager::connect(&settings)?);
    info!("Chain connections initialized");

    let order_store = Arc::new(OrderStore::new(settings.relayer.max_pending_orders));
    let resolver = Resolver::new(
        chains.clone(),
        order_store,
        state_store.clone(),
        settings.relayer.clone(),
    );
    info!("Resolver initialized");

    let supervisor = Arc::new(Supervisor::new(
        chains.clone(),
        resolver.clone(),
        state_store.clone(),
        settings.clone(),
    ));
    supervisor.start().await;

    // API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let resolver = resolver.clone();
        let chains = chains.clone();
        let state_store = state_store.clone();
        async move {
            if let Err(e) = api::run_server(config, resolver, chains, state_store).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("HTLC Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    supervisor.stop().await;

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,htlc_relayer=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
