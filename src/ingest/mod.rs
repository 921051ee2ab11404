//! Per-chain confirmed-block polling loop
//!
//! Advances a persisted cursor, fetches a bounded window of events at
//! the confirmation depth, hands them to the resolver in order, and
//! commits the cursor only after dispatch. A crash between dispatch
//! and commit replays events; the resolver deduplicates.

use crate::chain::ChainAdapter;
use crate::resolver::order::ChainId;
use crate::resolver::Resolver;
use crate::state::StateStore;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Blocks scanned behind the confirmed tip on a cold start
const COLD_START_LOOKBACK: u64 = 100;

/// Processed-event keys are pruned this far behind the cursor
const DEDUP_PRUNE_LAG: u64 = 1_000;

pub struct EventIngestor {
    chain_id: ChainId,
    adapter: Arc<ChainAdapter>,
    resolver: Arc<Resolver>,
    state: Arc<dyn StateStore>,
    poll_interval: Duration,
    shutdown: Arc<RwLock<bool>>,
}

impl EventIngestor {
    pub fn new(
        adapter: Arc<ChainAdapter>,
        resolver: Arc<Resolver>,
        state: Arc<dyn StateStore>,
        poll_interval: Duration,
        shutdown: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            chain_id: adapter.chain_id(),
            adapter,
            resolver,
            state,
            poll_interval,
            shutdown,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Main polling loop; returns when shutdown is signalled
    pub async fn run(&self) {
        let mut cursor = self.initialize_cursor().await;
        info!(
            chain_id = self.chain_id,
            cursor, "Event ingestor started"
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }
            tokio::time::sleep(jittered(self.poll_interval)).await;
            if *self.shutdown.read().await {
                break;
            }

            let confirmed = match self.adapter.confirmed_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(
                        chain_id = self.chain_id,
                        error = %e,
                        "Failed to read confirmed height"
                    );
                    continue;
                }
            };
            crate::metrics::record_confirmed_height(self.chain_id, confirmed);

            if confirmed <= cursor {
                continue;
            }

            let from = cursor + 1;
            let to = std::cmp::min(confirmed, cursor + self.adapter.max_blocks_per_query());

            match self.adapter.query_events(from, to).await {
                Ok(events) => {
                    debug!(
                        chain_id = self.chain_id,
                        from,
                        to,
                        count = events.len(),
                        "Dispatching events"
                    );
                    for event in events {
                        let key = event.key();
                        let block_number = event.block_number;
                        self.resolver.on_event(event).await;
                        if let Err(e) = self.state.insert_processed(&key, block_number).await {
                            warn!(
                                chain_id = self.chain_id,
                                error = %e,
                                "Failed to persist processed event key"
                            );
                        }
                    }

                    // Dispatch succeeded for the whole window; the
                    // cursor may now pass it.
                    match self.state.save_cursor(self.chain_id, to).await {
                        Ok(()) => {
                            cursor = to;
                            crate::metrics::record_cursor(self.chain_id, cursor);
                        }
                        Err(e) => {
                            // Events were dispatched; redelivery after
                            // restart is handled by the dedup set.
                            warn!(
                                chain_id = self.chain_id,
                                error = %e,
                                "Failed to persist cursor, will retry window"
                            );
                        }
                    }

                    if cursor > DEDUP_PRUNE_LAG {
                        if let Err(e) = self
                            .state
                            .prune_processed(self.chain_id, cursor - DEDUP_PRUNE_LAG)
                            .await
                        {
                            debug!(
                                chain_id = self.chain_id,
                                error = %e,
                                "Dedup prune failed"
                            );
                        }
                    }
                }
                Err(e) if e.should_alert() => {
                    // Malformed chain data: never advance past the
                    // offending block.
                    error!(
                        chain_id = self.chain_id,
                        from,
                        to,
                        error = %e,
                        "Event window failed to decode; cursor held for operator attention"
                    );
                    crate::metrics::record_decode_failure(self.chain_id);
                }
                Err(e) => {
                    warn!(
                        chain_id = self.chain_id,
                        error = %e,
                        "Event query failed, retrying next tick"
                    );
                }
            }
        }

        info!(chain_id = self.chain_id, "Event ingestor stopped");
    }

    /// Load the persisted cursor, or start just behind the confirmed
    /// tip so a fresh service does not re-scan history.
    async fn initialize_cursor(&self) -> u64 {
        loop {
            match self.state.get_cursor(self.chain_id).await {
                Ok(Some(cursor)) => {
                    match self.state.load_processed(self.chain_id).await {
                        Ok(keys) => {
                            debug!(
                                chain_id = self.chain_id,
                                count = keys.len(),
                                "Reloaded dedup set"
                            );
                            self.resolver.store().load_seen(keys);
                        }
                        Err(e) => {
                            warn!(
                                chain_id = self.chain_id,
                                error = %e,
                                "Failed to reload dedup set"
                            );
                        }
                    }
                    return cursor;
                }
                Ok(None) => match self.adapter.confirmed_height().await {
                    Ok(confirmed) => {
                        let cursor = confirmed.saturating_sub(COLD_START_LOOKBACK);
                        info!(
                            chain_id = self.chain_id,
                            cursor, "Cold start, initializing cursor behind confirmed tip"
                        );
                        if let Err(e) = self.state.save_cursor(self.chain_id, cursor).await {
                            warn!(
                                chain_id = self.chain_id,
                                error = %e,
                                "Failed to persist cold-start cursor"
                            );
                        }
                        return cursor;
                    }
                    Err(e) => {
                        warn!(
                            chain_id = self.chain_id,
                            error = %e,
                            "Cold start blocked on confirmed height, retrying"
                        );
                        tokio::time::sleep(self.poll_interval).await;
                    }
                },
                Err(e) => {
                    warn!(
                        chain_id = self.chain_id,
                        error = %e,
                        "Cursor load failed, retrying"
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
            if *self.shutdown.read().await {
                return 0;
            }
        }
    }
}

/// Add +/-10% jitter so the two chain loops do not fire in lockstep
pub fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis == 0 {
        return base;
    }
    let spread = millis / 10;
    if spread == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(0..=2 * spread);
    Duration::from_millis(millis - spread + offset)
}
