//! Supervisor: lifecycle of ingestors, workers and periodic tasks
//!
//! Owns every component; components only ever hold a handle to the
//! adapters. Recurring tasks run with jitter so the two chains and the
//! periodic passes never fire in synchronized bursts.

use crate::chain::ChainManager;
use crate::config::Settings;
use crate::ingest::{jittered, EventIngestor};
use crate::resolver::Resolver;
use crate::state::StateStore;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Supervisor {
    chains: Arc<ChainManager>,
    resolver: Arc<Resolver>,
    state: Arc<dyn StateStore>,
    settings: Settings,
    shutdown: Arc<RwLock<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        chains: Arc<ChainManager>,
        resolver: Arc<Resolver>,
        state: Arc<dyn StateStore>,
        settings: Settings,
    ) -> Self {
        Self {
            chains,
            resolver,
            state,
            settings,
            shutdown: Arc::new(RwLock::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<RwLock<bool>> {
        self.shutdown.clone()
    }

    /// Start ingestors, the worker pool and all periodic tasks
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        let relayer = &self.settings.relayer;

        // Action workers
        let workers = self
            .resolver
            .clone()
            .spawn_workers(relayer.effective_workers())
            .await;
        info!(count = workers.len(), "Action workers started");
        handles.extend(workers);

        // Per-chain event ingestors
        for chain_id in self.chains.chain_ids() {
            let adapter = match self.chains.get(chain_id) {
                Ok(a) => a,
                Err(_) => continue,
            };
            let ingestor = EventIngestor::new(
                adapter,
                self.resolver.clone(),
                self.state.clone(),
                Duration::from_secs(relayer.polling_interval_secs),
                self.shutdown.clone(),
            );
            handles.push(tokio::spawn(async move {
                ingestor.run().await;
            }));
        }

        // Initial fee quotes, then periodic refresh per chain
        for chain_id in self.chains.chain_ids() {
            if let Ok(adapter) = self.chains.get(chain_id) {
                adapter.refresh_fee_quote().await;
                let interval = Duration::from_secs(relayer.fee_refresh_interval_secs);
                let shutdown = self.shutdown.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(jittered(interval)).await;
                        if *shutdown.read().await {
                            break;
                        }
                        adapter.refresh_fee_quote().await;
                    }
                }));
            }
        }

        // Timeout sweep, with retention GC and a matching pass folded
        // onto the same clock
        {
            let resolver = self.resolver.clone();
            let interval = Duration::from_secs(relayer.sweep_interval_secs);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(jittered(interval)).await;
                    if *shutdown.read().await {
                        break;
                    }
                    let now = Utc::now().timestamp() as u64;
                    resolver.timeout_sweep(now).await;
                    resolver.match_pass(now).await;
                    resolver.gc();
                }
            }));
        }

        // Reconciliation
        {
            let resolver = self.resolver.clone();
            let interval = Duration::from_secs(relayer.reconcile_interval_secs);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(jittered(interval)).await;
                    if *shutdown.read().await {
                        break;
                    }
                    resolver.reconcile().await;
                }
            }));
        }

        // Adapter and store health
        {
            let chains = self.chains.clone();
            let state = self.state.clone();
            let resolver = self.resolver.clone();
            let interval = Duration::from_secs(relayer.health_check_interval_secs);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(jittered(interval)).await;
                    if *shutdown.read().await {
                        break;
                    }
                    for (chain_id, healthy) in chains.health_check().await {
                        if !healthy {
                            warn!(chain_id, "Chain health check failed");
                        }
                    }
                    match state.health_check().await {
                        Ok(()) => crate::metrics::record_health_check(),
                        Err(e) => {
                            warn!(error = %e, "State store health check failed");
                            crate::metrics::record_health_check_failure();
                        }
                    }
                    // Refresh the order gauges on the same clock
                    let _ = resolver.stats().await;
                }
            }));
        }

        info!("Supervisor started all tasks");
    }

    /// Signal shutdown, drain in-flight submissions, then abort
    /// whatever remains
    pub async fn stop(&self) {
        info!("Supervisor stopping");
        *self.shutdown.write().await = true;

        let grace = Duration::from_secs(self.settings.relayer.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.resolver.inflight_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    inflight = self.resolver.inflight_count(),
                    "Shutdown grace elapsed with submissions still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("Supervisor stopped");
    }
}
