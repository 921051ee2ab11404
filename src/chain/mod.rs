//! Chain module - the adapter layer over the two ledgers
//!
//! This module provides:
//! - The `ChainClient` capability trait and its EVM implementation
//! - The `ChainAdapter` policy wrapper (finality, windows, retry, fees)
//! - `ChainManager`, holding the pair of adapters

pub mod adapter;
pub mod client;

pub use adapter::{AdapterPolicy, ChainAdapter};
pub use client::{
    ChainAction, ChainClient, EvmChainClient, FeeQuote, HtlcView, OrderView, SubmissionReceipt,
};

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::resolver::order::ChainId;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Holds the adapters for the two configured chains
pub struct ChainManager {
    adapters: DashMap<ChainId, Arc<ChainAdapter>>,
}

impl ChainManager {
    /// Connect to all enabled chains from configuration
    pub fn connect(settings: &Settings) -> RelayerResult<Self> {
        let adapters = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                chain_config.name, chain_config.chain_id
            );

            let client = Arc::new(EvmChainClient::new(chain_config.clone())?);
            let policy = AdapterPolicy {
                confirmation_depth: chain_config.confirmation_depth,
                max_blocks_per_query: settings.relayer.max_blocks_per_query,
                retry_attempts: settings.relayer.retry_attempts,
                retry_base_delay: Duration::from_secs(settings.relayer.retry_base_delay_secs),
                query_deadline: Duration::from_secs(settings.relayer.query_deadline_secs),
                receipt_deadline: Duration::from_secs(settings.relayer.receipt_deadline_secs),
                min_gas_limit: chain_config.min_gas_limit,
                max_inflight_submissions: settings.relayer.max_inflight_submissions,
            };
            let adapter = ChainAdapter::new(
                name.clone(),
                client,
                policy,
                chain_config.supports_incoming_orders,
            );
            adapters.insert(chain_config.chain_id, Arc::new(adapter));

            info!("Chain {} initialized", chain_config.name);
        }

        Ok(Self { adapters })
    }

    /// Build a manager from pre-constructed adapters (tests)
    pub fn from_adapters(list: Vec<Arc<ChainAdapter>>) -> Self {
        let adapters = DashMap::new();
        for adapter in list {
            adapters.insert(adapter.chain_id(), adapter);
        }
        Self { adapters }
    }

    /// Get the adapter for a chain
    pub fn get(&self, chain_id: ChainId) -> RelayerResult<Arc<ChainAdapter>> {
        self.adapters
            .get(&chain_id)
            .map(|a| a.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// All connected chain ids
    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.adapters.iter().map(|e| *e.key()).collect()
    }

    /// Health check across all chains, in parallel
    pub async fn health_check(&self) -> Vec<(ChainId, bool)> {
        let checks: Vec<_> = self
            .adapters
            .iter()
            .map(|entry| {
                let chain_id = *entry.key();
                let adapter = entry.value().clone();
                async move { (chain_id, adapter.health_check().await) }
            })
            .collect();
        futures::future::join_all(checks).await
    }
}
