//! Durable state: per-chain cursors and the event-dedup set
//!
//! Orders and secrets live in memory; the only externalized artifacts
//! are each chain's cursor, the processed-event keys above it, and an
//! audit trail of terminal orders.

pub mod postgres;

pub use postgres::PgStateStore;

use crate::error::RelayerResult;
use crate::events::EventKey;
use crate::resolver::order::{ChainId, CrossChainOrder};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Persistence interface for ingestion progress
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Highest fully-processed block for a chain, if any
    async fn get_cursor(&self, chain_id: ChainId) -> RelayerResult<Option<u64>>;

    /// Advance a chain's cursor. Must never move it backwards.
    async fn save_cursor(&self, chain_id: ChainId, height: u64) -> RelayerResult<()>;

    /// Record one processed event key
    async fn insert_processed(&self, key: &EventKey, block_number: u64) -> RelayerResult<()>;

    /// All processed keys for a chain (startup dedup reconstruction)
    async fn load_processed(&self, chain_id: ChainId) -> RelayerResult<Vec<EventKey>>;

    /// Drop processed keys at or below a height already covered by the
    /// cursor
    async fn prune_processed(&self, chain_id: ChainId, below: u64) -> RelayerResult<()>;

    /// Append a terminal order to the audit trail
    async fn record_terminal_order(&self, order: &CrossChainOrder) -> RelayerResult<()>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStateStore {
    cursors: RwLock<HashMap<ChainId, u64>>,
    processed: RwLock<HashMap<ChainId, HashSet<(EventKey, u64)>>>,
    audit: RwLock<Vec<CrossChainOrder>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_len(&self) -> usize {
        self.audit.read().unwrap().len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_cursor(&self, chain_id: ChainId) -> RelayerResult<Option<u64>> {
        Ok(self.cursors.read().unwrap().get(&chain_id).copied())
    }

    async fn save_cursor(&self, chain_id: ChainId, height: u64) -> RelayerResult<()> {
        let mut cursors = self.cursors.write().unwrap();
        let entry = cursors.entry(chain_id).or_insert(0);
        if height > *entry {
            *entry = height;
        }
        Ok(())
    }

    async fn insert_processed(&self, key: &EventKey, block_number: u64) -> RelayerResult<()> {
        self.processed
            .write()
            .unwrap()
            .entry(key.chain_id)
            .or_default()
            .insert((*key, block_number));
        Ok(())
    }

    async fn load_processed(&self, chain_id: ChainId) -> RelayerResult<Vec<EventKey>> {
        Ok(self
            .processed
            .read()
            .unwrap()
            .get(&chain_id)
            .map(|set| set.iter().map(|(k, _)| *k).collect())
            .unwrap_or_default())
    }

    async fn prune_processed(&self, chain_id: ChainId, below: u64) -> RelayerResult<()> {
        if let Some(set) = self.processed.write().unwrap().get_mut(&chain_id) {
            set.retain(|(_, block)| *block >= below);
        }
        Ok(())
    }

    async fn record_terminal_order(&self, order: &CrossChainOrder) -> RelayerResult<()> {
        self.audit.write().unwrap().push(order.clone());
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}
