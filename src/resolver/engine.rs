//! Protocol engine: drives orders through the atomic-swap state machine
//!
//! Consumes normalized events and clock ticks, emits chain actions
//! through the adapters. Event handlers never propagate errors out of
//! `on_event`; failures become order annotations plus logs and
//! metrics.

use crate::chain::{ChainAction, ChainManager, SubmissionReceipt};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventPayload};
use crate::resolver::matching::{self, MatchCandidate};
use crate::resolver::order::{
    secret_matches, validate_timelock_bounds, validate_timelock_skew, ChainId, CrossChainOrder,
    Hashlock, HtlcPhase, HtlcState, OrderHash, OrderState, Secret,
};
use crate::resolver::store::{OrderStats, OrderStore};
use crate::state::StateStore;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 1024;

/// A chain submission bound to an order, executed by the worker pool
#[derive(Debug, Clone)]
pub struct OrderCommand {
    pub order_hash: OrderHash,
    pub chain_id: ChainId,
    pub action: ChainAction,
    pub attempt: u32,
}

pub struct Resolver {
    chains: Arc<ChainManager>,
    store: Arc<OrderStore>,
    state: Arc<dyn StateStore>,
    config: RelayerConfig,
    command_tx: mpsc::Sender<OrderCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<OrderCommand>>>,
    inflight: AtomicUsize,
}

impl Resolver {
    pub fn new(
        chains: Arc<ChainManager>,
        store: Arc<OrderStore>,
        state: Arc<dyn StateStore>,
        config: RelayerConfig,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        Arc::new(Self {
            chains,
            store,
            state,
            config,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            inflight: AtomicUsize::new(0),
        })
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    /// Commands currently being executed by workers
    pub fn inflight_count(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Handle one normalized event. Idempotent per
    /// `(chain, tx_hash, log_index)`; never returns an error.
    pub async fn on_event(&self, event: ChainEvent) {
        let key = event.key();
        if !self.store.mark_seen(key) {
            debug!(
                chain_id = event.chain_id,
                kind = event.kind(),
                "Duplicate event delivery, skipping"
            );
            crate::metrics::record_event_deduplicated(event.chain_id);
            return;
        }

        debug!(
            chain_id = event.chain_id,
            block = event.block_number,
            kind = event.kind(),
            "Handling event"
        );
        crate::metrics::record_event(event.chain_id, event.kind());

        match event.payload.clone() {
            EventPayload::OrderCreated { .. } => self.handle_order_created(&event).await,
            EventPayload::HtlcCreated { .. } => self.handle_htlc_created(&event).await,
            EventPayload::HtlcClaimed { .. } => self.handle_htlc_claimed(&event).await,
            EventPayload::HtlcRefunded { .. } => self.handle_htlc_refunded(&event).await,
            EventPayload::OrderFulfilled { order_hash, .. } => {
                // Advisory. The secret in this event is deliberately
                // ignored: secrets enter the store only from observed
                // HTLC claims.
                debug!(
                    chain_id = event.chain_id,
                    order_hash = %hex::encode(order_hash),
                    "Bridge reports order fulfilled"
                );
            }
            EventPayload::OrderRefunded { order_hash } => {
                self.handle_order_refunded(event.chain_id, order_hash).await
            }
        }
    }

    async fn handle_order_created(&self, event: &ChainEvent) {
        let EventPayload::OrderCreated {
            order_hash,
            maker,
            receiver,
            token_in,
            token_out,
            amount_in,
            amount_out,
            hashlock,
            timelock,
            target_chain_id,
        } = event.payload.clone()
        else {
            return;
        };

        if self.store.contains(&order_hash) {
            debug!(order_hash = %hex::encode(order_hash), "Order already tracked");
            return;
        }

        let now = Utc::now();
        let order = CrossChainOrder::new(
            order_hash,
            event.chain_id,
            target_chain_id,
            token_in,
            token_out,
            amount_in,
            amount_out,
            maker,
            receiver,
            hashlock,
            timelock,
            now,
        );

        let validation = self.validate_new_order(&order);

        if let Err(e) = self.store.insert(order) {
            // Capacity: the order is rejected at ingestion entirely
            warn!(
                order_hash = %hex::encode(order_hash),
                error = %e,
                "Rejecting new order"
            );
            return;
        }

        let Some(slot) = self.store.get(&order_hash) else {
            return;
        };
        let mut order = slot.lock().await;

        if let Err(e) = validation {
            error!(
                order_hash = %hex::encode(order_hash),
                error = %e,
                "Order failed validation at ingestion"
            );
            crate::metrics::record_invariant_breach(event.chain_id);
            self.fail_order(&mut order).await;
            return;
        }

        if order.transition(OrderState::SourceLocked, now).is_ok() {
            crate::metrics::record_order_transition(OrderState::SourceLocked.as_str());
        }
        let order_hashlock = order.hashlock;
        info!(
            order_hash = %hex::encode(order_hash),
            source = order.source_chain,
            target = order.target_chain,
            "New cross-chain order, source funds locked"
        );

        // Mirror the order on the target bridge when it supports it;
        // otherwise the swap advances on HTLC observation alone.
        match self.chains.get(order.target_chain) {
            Ok(target) if target.supports_incoming_orders() => {
                let margin = self.config.timelock_safety_margin_secs;
                self.enqueue(OrderCommand {
                    order_hash,
                    chain_id: order.target_chain,
                    action: ChainAction::ProcessIncomingOrder {
                        order_hash,
                        receiver: order.receiver,
                        token_out: order.token_out,
                        amount_out: order.amount_out,
                        hashlock: order.hashlock,
                        timelock: order.timelock.saturating_sub(margin),
                    },
                    attempt: 0,
                });
            }
            Ok(_) => {
                debug!(
                    order_hash = %hex::encode(order_hash),
                    "Target bridge does not accept incoming orders, skipping relay"
                );
            }
            Err(e) => {
                error!(
                    order_hash = %hex::encode(order_hash),
                    error = %e,
                    "Unknown target chain for order"
                );
                crate::metrics::record_invariant_breach(event.chain_id);
                self.fail_order(&mut order).await;
                return;
            }
        }

        // HTLC events from the target chain may have arrived before
        // this order; hand them back through their handlers now.
        drop(order);
        self.replay_orphans(order_hashlock).await;
    }

    async fn replay_orphans(&self, hashlock: Hashlock) {
        let buffered = self.store.drain_orphans(&hashlock);
        if buffered.is_empty() {
            return;
        }
        debug!(
            hashlock = %hex::encode(hashlock),
            count = buffered.len(),
            "Replaying events observed before their order"
        );
        for event in buffered {
            match &event.payload {
                EventPayload::HtlcCreated { .. } => self.handle_htlc_created(&event).await,
                EventPayload::HtlcClaimed { .. } => self.handle_htlc_claimed(&event).await,
                EventPayload::HtlcRefunded { .. } => self.handle_htlc_refunded(&event).await,
                _ => {}
            }
        }
    }

    fn validate_new_order(&self, order: &CrossChainOrder) -> RelayerResult<()> {
        if order.source_chain == order.target_chain {
            return Err(RelayerError::InvariantBreach {
                order_hash: hex::encode(order.order_hash),
                message: "source and target chain are identical".to_string(),
            });
        }
        if order.amount_in.is_zero() || order.amount_out.is_zero() {
            return Err(RelayerError::InvariantBreach {
                order_hash: hex::encode(order.order_hash),
                message: "zero amount".to_string(),
            });
        }
        let now = Utc::now().timestamp() as u64;
        validate_timelock_bounds(
            order.timelock,
            now,
            self.config.min_timelock_secs,
            self.config.max_timelock_secs,
        )
        .map_err(|_| RelayerError::InvariantBreach {
            order_hash: hex::encode(order.order_hash),
            message: format!("timelock {} outside configured bounds", order.timelock),
        })
    }

    async fn handle_htlc_created(&self, event: &ChainEvent) {
        let EventPayload::HtlcCreated {
            htlc_id,
            sender,
            receiver,
            token,
            amount,
            hashlock,
            timelock,
        } = event.payload.clone()
        else {
            return;
        };

        let Some(slot) = self.store.find_by_hashlock(&hashlock) else {
            // The order may simply not have been observed yet; park
            // the event until it is.
            debug!(
                chain_id = event.chain_id,
                htlc_id = %hex::encode(htlc_id),
                "HTLC precedes its order, buffering"
            );
            self.store
                .buffer_orphan(hashlock, event.chain_id, htlc_id, event.clone());
            return;
        };
        let mut order = slot.lock().await;
        let order_hash = order.order_hash;

        // I6: at most one live HTLC per order per chain
        if order.htlc_on(event.chain_id).is_some() {
            warn!(
                order_hash = %hex::encode(order_hash),
                chain_id = event.chain_id,
                "Second HtlcCreated for order on same chain, ignoring"
            );
            crate::metrics::record_invariant_breach(event.chain_id);
            return;
        }

        let htlc = HtlcState {
            htlc_id,
            sender,
            receiver,
            token,
            amount,
            hashlock,
            timelock,
            phase: HtlcPhase::Locked,
        };

        let now = Utc::now();
        if event.chain_id == order.source_chain {
            self.store.register_htlc(event.chain_id, htlc_id, order_hash);
            order.source_htlc = Some(htlc);
            order.updated_at = now;

            if amount != order.amount_in || timelock != order.timelock {
                error!(
                    order_hash = %hex::encode(order_hash),
                    "Source HTLC does not match order terms"
                );
                crate::metrics::record_invariant_breach(event.chain_id);
                self.fail_order(&mut order).await;
                return;
            }
            info!(
                order_hash = %hex::encode(order_hash),
                "Source HTLC observed"
            );
        } else if event.chain_id == order.target_chain {
            self.store.register_htlc(event.chain_id, htlc_id, order_hash);
            order.target_htlc = Some(htlc);
            order.target_timelock = Some(timelock);
            order.updated_at = now;

            if amount != order.amount_out {
                error!(
                    order_hash = %hex::encode(order_hash),
                    "Target HTLC amount does not match order"
                );
                crate::metrics::record_invariant_breach(event.chain_id);
                self.fail_order(&mut order).await;
                return;
            }
            if validate_timelock_skew(
                order.timelock,
                timelock,
                self.config.timelock_safety_margin_secs,
            )
            .is_err()
            {
                error!(
                    order_hash = %hex::encode(order_hash),
                    source_timelock = order.timelock,
                    target_timelock = timelock,
                    "Target HTLC violates timelock skew"
                );
                crate::metrics::record_invariant_breach(event.chain_id);
                self.fail_order(&mut order).await;
                return;
            }

            if order.state == OrderState::SourceLocked {
                if order.transition(OrderState::TargetLocked, now).is_ok() {
                    crate::metrics::record_order_transition(
                        OrderState::TargetLocked.as_str(),
                    );
                    info!(
                        order_hash = %hex::encode(order_hash),
                        "Target HTLC observed, both sides locked"
                    );
                }
            }
        }
    }

    async fn handle_htlc_claimed(&self, event: &ChainEvent) {
        let EventPayload::HtlcClaimed { htlc_id, secret } = event.payload.clone() else {
            return;
        };
        let chain_id = event.chain_id;

        let Some(slot) = self.store.find_by_htlc(chain_id, &htlc_id) else {
            // A claim for an HTLC whose creation is still parked joins
            // it in the orphan buffer.
            if let Some(hashlock) = self.store.orphan_hashlock_for(chain_id, &htlc_id) {
                self.store
                    .buffer_orphan(hashlock, chain_id, htlc_id, event.clone());
            } else {
                debug!(
                    chain_id,
                    htlc_id = %hex::encode(htlc_id),
                    "Claim on unknown HTLC"
                );
            }
            return;
        };
        let mut order = slot.lock().await;
        let order_hash = order.order_hash;

        // I1: the revealed secret must open the order's hashlock
        if !secret_matches(&secret, &order.hashlock) {
            error!(
                order_hash = %hex::encode(order_hash),
                chain_id,
                "Claimed secret does not match hashlock, ignoring"
            );
            crate::metrics::record_invariant_breach(chain_id);
            return;
        }

        let now = Utc::now();
        self.store.put_secret(order_hash, secret);
        order.secret = Some(secret);
        order.updated_at = now;

        let (claimed_source, other_chain) = if chain_id == order.source_chain {
            order.source_claimed = true;
            if let Some(h) = order.source_htlc.as_mut() {
                h.phase = HtlcPhase::Claimed;
            }
            (true, order.target_chain)
        } else {
            order.target_claimed = true;
            if let Some(h) = order.target_htlc.as_mut() {
                h.phase = HtlcPhase::Claimed;
            }
            (false, order.source_chain)
        };

        info!(
            order_hash = %hex::encode(order_hash),
            chain_id,
            source_side = claimed_source,
            "HTLC claimed, secret learned"
        );

        // Propagate the secret: claim the other side if we hold a live
        // HTLC there that names us as receiver.
        self.propagate_secret(&mut order, other_chain, secret).await;

        if order.source_claimed && order.target_claimed && order.state == OrderState::TargetLocked
        {
            if order.transition(OrderState::Fulfilled, now).is_ok() {
                crate::metrics::record_order_transition(OrderState::Fulfilled.as_str());
                info!(order_hash = %hex::encode(order_hash), "Order fulfilled on both chains");
                self.finalize_terminal(&order).await;
            }
        }
    }

    async fn propagate_secret(
        &self,
        order: &mut CrossChainOrder,
        other_chain: ChainId,
        secret: Secret,
    ) {
        if order.halted {
            return;
        }
        let Some(htlc) = order.htlc_on(other_chain) else {
            return;
        };
        if htlc.phase != HtlcPhase::Locked {
            return;
        }
        let Ok(adapter) = self.chains.get(other_chain) else {
            return;
        };
        if htlc.receiver != adapter.relayer_address() {
            debug!(
                order_hash = %hex::encode(order.order_hash),
                chain_id = other_chain,
                "Counterparty owns the other HTLC, leaving claim to them"
            );
            return;
        }

        crate::metrics::record_secret_propagated(other_chain);
        self.enqueue(OrderCommand {
            order_hash: order.order_hash,
            chain_id: other_chain,
            action: ChainAction::ClaimHtlc {
                htlc_id: htlc.htlc_id,
                secret,
            },
            attempt: 0,
        });
    }

    async fn handle_htlc_refunded(&self, event: &ChainEvent) {
        let EventPayload::HtlcRefunded { htlc_id } = event.payload.clone() else {
            return;
        };
        let chain_id = event.chain_id;

        let Some(slot) = self.store.find_by_htlc(chain_id, &htlc_id) else {
            if let Some(hashlock) = self.store.orphan_hashlock_for(chain_id, &htlc_id) {
                self.store
                    .buffer_orphan(hashlock, chain_id, htlc_id, event.clone());
            } else {
                debug!(chain_id, htlc_id = %hex::encode(htlc_id), "Refund on unknown HTLC");
            }
            return;
        };
        let mut order = slot.lock().await;
        let order_hash = order.order_hash;
        let now = Utc::now();
        order.updated_at = now;

        if chain_id == order.source_chain {
            order.source_refunded = true;
            if let Some(h) = order.source_htlc.as_mut() {
                h.phase = HtlcPhase::Refunded;
            }
            if !order.is_terminal() {
                if order.transition(OrderState::Refunded, now).is_ok() {
                    crate::metrics::record_order_transition(OrderState::Refunded.as_str());
                    info!(order_hash = %hex::encode(order_hash), "Source refunded, order closed");
                    self.finalize_terminal(&order).await;
                }
            } else {
                info!(
                    order_hash = %hex::encode(order_hash),
                    state = order.state.as_str(),
                    "Source HTLC refunded on terminal order"
                );
            }
        } else if chain_id == order.target_chain {
            // Target refunded while source may remain locked; the swap
            // continues until the source refund happens or is forced.
            order.target_refunded = true;
            if let Some(h) = order.target_htlc.as_mut() {
                h.phase = HtlcPhase::Refunded;
            }
            info!(
                order_hash = %hex::encode(order_hash),
                "Target HTLC refunded, awaiting source refund"
            );
        }
    }

    async fn handle_order_refunded(&self, chain_id: ChainId, order_hash: OrderHash) {
        let Some(slot) = self.store.get(&order_hash) else {
            debug!(order_hash = %hex::encode(order_hash), "Refund advisory for unknown order");
            return;
        };
        let mut order = slot.lock().await;
        if chain_id != order.source_chain {
            return;
        }
        let now = Utc::now();
        order.source_refunded = true;
        order.updated_at = now;
        if !order.is_terminal() && order.transition(OrderState::Refunded, now).is_ok() {
            crate::metrics::record_order_transition(OrderState::Refunded.as_str());
            info!(order_hash = %hex::encode(order_hash), "Bridge refunded source, order closed");
            self.finalize_terminal(&order).await;
        }
    }

    /// Mark an order failed (invariant breach). The mandatory refund at
    /// timelock still happens via the sweep.
    async fn fail_order(&self, order: &mut CrossChainOrder) {
        if order.is_terminal() {
            return;
        }
        let now = Utc::now();
        if order.transition(OrderState::Failed, now).is_ok() {
            crate::metrics::record_order_transition(OrderState::Failed.as_str());
            self.finalize_terminal(order).await;
        }
    }

    /// Terminal bookkeeping: eviction clock and audit trail
    async fn finalize_terminal(&self, order: &CrossChainOrder) {
        self.store.mark_terminal(order.order_hash, order.updated_at);
        if let Err(e) = self.state.record_terminal_order(order).await {
            warn!(
                order_hash = %hex::encode(order.order_hash),
                error = %e,
                "Failed to record terminal order in audit trail"
            );
        }
    }

    // ------------------------------------------------------------------
    // Manual fulfillment (control surface)
    // ------------------------------------------------------------------

    /// Lock target funds for an order using a known secret. Exposed via
    /// the HTTP surface; the secret is verified before anything is
    /// submitted.
    pub async fn submit_fulfill(&self, order_hash: OrderHash, secret: Secret) -> RelayerResult<()> {
        let slot = self.store.get(&order_hash).ok_or(RelayerError::OrderNotFound {
            order_hash: hex::encode(order_hash),
        })?;
        let order = slot.lock().await;

        if !secret_matches(&secret, &order.hashlock) {
            return Err(RelayerError::InvalidSecret {
                order_hash: hex::encode(order_hash),
            });
        }
        if !matches!(
            order.state,
            OrderState::SourceLocked | OrderState::TargetLocked
        ) {
            return Err(RelayerError::InvalidStateTransition {
                from: order.state.as_str().to_string(),
                to: "fulfilling".to_string(),
            });
        }

        let target = self.chains.get(order.target_chain)?;
        let action = if target.supports_incoming_orders() {
            ChainAction::FulfillIncomingOrder { order_hash, secret }
        } else {
            ChainAction::CreateHtlc {
                receiver: order.receiver,
                hashlock: order.hashlock,
                timelock: order
                    .timelock
                    .saturating_sub(self.config.timelock_safety_margin_secs),
                token: order.token_out,
                amount: order.amount_out,
            }
        };
        self.enqueue(OrderCommand {
            order_hash,
            chain_id: order.target_chain,
            action,
            attempt: 0,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timeout sweep
    // ------------------------------------------------------------------

    /// Refund source-side locks whose timelock has elapsed. Runs on the
    /// supervisor clock; `now_unix` is the service's monotone view of
    /// wall time.
    pub async fn timeout_sweep(&self, now_unix: u64) {
        for hash in self.store.all_hashes() {
            let Some(slot) = self.store.get(&hash) else {
                continue;
            };
            let mut order = slot.lock().await;
            if order.halted {
                continue;
            }

            match order.state {
                OrderState::Fulfilled | OrderState::Refunded => continue,
                OrderState::Failed => {
                    // Invariant breaches still get their mandatory
                    // refund once the timelock elapses.
                    if order.source_expired(now_unix)
                        && !order.source_refunded
                        && !order.refund_submitted
                        && order.source_htlc.is_some()
                    {
                        self.submit_source_refund(&mut order).await;
                    }
                }
                _ => {
                    if order.source_expired(now_unix)
                        && !order.source_refunded
                        && !order.refund_submitted
                    {
                        info!(
                            order_hash = %hex::encode(hash),
                            state = order.state.as_str(),
                            "Source timelock elapsed, submitting refund"
                        );
                        self.submit_source_refund(&mut order).await;
                    } else if order.state == OrderState::SourceLocked
                        && now_unix + self.config.order_timeout_buffer_secs >= order.timelock
                    {
                        warn!(
                            order_hash = %hex::encode(hash),
                            timelock = order.timelock,
                            "Target never locked inside the timeout buffer, awaiting refund window"
                        );
                    }
                }
            }
        }
    }

    async fn submit_source_refund(&self, order: &mut CrossChainOrder) {
        order.refund_submitted = true;
        self.enqueue(OrderCommand {
            order_hash: order.order_hash,
            chain_id: order.source_chain,
            action: ChainAction::RefundOrder {
                order_hash: order.order_hash,
            },
            attempt: 0,
        });
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Re-read authoritative state from both chains and repair
    /// divergence.
    pub async fn reconcile(&self) {
        for hash in self.store.non_terminal_hashes() {
            if let Err(e) = self.reconcile_order(hash).await {
                warn!(
                    order_hash = %hex::encode(hash),
                    error = %e,
                    "Reconciliation pass failed for order"
                );
            }
        }
    }

    async fn reconcile_order(&self, hash: OrderHash) -> RelayerResult<()> {
        let Some(slot) = self.store.get(&hash) else {
            return Ok(());
        };
        let mut order = slot.lock().await;
        if order.is_terminal() || order.halted {
            return Ok(());
        }

        let source = self.chains.get(order.source_chain)?;
        let target = self.chains.get(order.target_chain)?;

        let source_order = source.order_view(hash).await?;
        let source_htlc = match &order.source_htlc {
            Some(h) => source.htlc_view(h.htlc_id).await?,
            None => None,
        };
        let target_htlc = match &order.target_htlc {
            Some(h) => target.htlc_view(h.htlc_id).await?,
            None => None,
        };

        let source_funded = source_order.as_ref().map(|v| v.funded).unwrap_or(false)
            || source_htlc
                .as_ref()
                .map(|v| v.phase == HtlcPhase::Locked)
                .unwrap_or(false);
        let source_claimed = source_htlc
            .as_ref()
            .map(|v| v.phase == HtlcPhase::Claimed)
            .unwrap_or(false)
            || source_order.as_ref().map(|v| v.fulfilled).unwrap_or(false);
        let source_refunded = source_htlc
            .as_ref()
            .map(|v| v.phase == HtlcPhase::Refunded)
            .unwrap_or(false)
            || source_order.as_ref().map(|v| v.refunded).unwrap_or(false);
        let target_locked = target_htlc
            .as_ref()
            .map(|v| v.phase == HtlcPhase::Locked)
            .unwrap_or(false);

        let now = Utc::now();

        match order.state {
            OrderState::SourceLocked => {
                if !source_funded && !source_claimed && !source_refunded {
                    error!(
                        order_hash = %hex::encode(hash),
                        "Source chain shows no lock for SourceLocked order, failing"
                    );
                    crate::metrics::record_reconciliation_action("source_lock_missing");
                    self.fail_order(&mut order).await;
                    return Ok(());
                }
            }
            OrderState::TargetLocked => {
                if order.target_htlc.is_some() && target_htlc.is_none() {
                    // The target lock we recorded was forked out; wait
                    // for it to be re-confirmed or for the timelock.
                    warn!(
                        order_hash = %hex::encode(hash),
                        "Target HTLC no longer on chain, reverting to SourceLocked"
                    );
                    crate::metrics::record_reconciliation_action("target_lock_reverted");
                    if let Some(h) = order.target_htlc.take() {
                        self.store.unregister_htlc(order.target_chain, &h.htlc_id);
                    }
                    order.target_timelock = None;
                    order.target_claimed = false;
                    let _ = order.transition(OrderState::SourceLocked, now);
                }
            }
            _ => {}
        }

        // Secret observable on source while the target stays locked:
        // re-attempt the target-side claim.
        if source_claimed && target_locked {
            let observed_secret = source_htlc
                .as_ref()
                .and_then(|v| v.secret)
                .or_else(|| source_order.as_ref().and_then(|v| v.secret))
                .or(order.secret);
            if let Some(secret) = observed_secret {
                if secret_matches(&secret, &order.hashlock) {
                    crate::metrics::record_reconciliation_action("target_claim_retried");
                    self.store.put_secret(hash, secret);
                    order.secret = Some(secret);
                    let target_chain = order.target_chain;
                    self.propagate_secret(&mut order, target_chain, secret).await;
                }
            }
        }

        // Source refunded while the target is still locked and ours to
        // claim: nothing safe remains to do automatically.
        if source_refunded && target_locked {
            let ours = order
                .target_htlc
                .as_ref()
                .map(|h| h.receiver == target.relayer_address())
                .unwrap_or(false);
            if ours {
                error!(
                    order_hash = %hex::encode(hash),
                    "CRITICAL: source refunded while target HTLC is live and claimable by us; halting order"
                );
                crate::metrics::record_reconciliation_action("critical_breach_halted");
                order.needs_attention = true;
                order.halted = true;
                order.updated_at = now;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Matching pass
    // ------------------------------------------------------------------

    /// Pair crossed outgoing orders. Purely an annotation; unmatched
    /// orders still fulfill manually.
    pub async fn match_pass(&self, now_unix: u64) {
        let mut candidates = Vec::new();
        for hash in self.store.non_terminal_hashes() {
            let Some(slot) = self.store.get(&hash) else {
                continue;
            };
            let order = slot.lock().await;
            if order.state == OrderState::SourceLocked && order.matched_with.is_none() {
                candidates.push(MatchCandidate {
                    order_hash: order.order_hash,
                    source_chain: order.source_chain,
                    target_chain: order.target_chain,
                    token_in: order.token_in,
                    token_out: order.token_out,
                    amount_in: order.amount_in,
                    amount_out: order.amount_out,
                    timelock: order.timelock,
                    created_at: order.created_at,
                });
            }
        }

        let pairs = matching::find_matches(
            &candidates,
            now_unix,
            self.config.timelock_safety_margin_secs,
        );
        for (a, b) in pairs {
            // Lock in hash order so two concurrent passes cannot
            // deadlock.
            let (first, second) = if a <= b { (a, b) } else { (b, a) };
            let (Some(slot_a), Some(slot_b)) = (self.store.get(&first), self.store.get(&second))
            else {
                continue;
            };
            let mut oa = slot_a.lock().await;
            let mut ob = slot_b.lock().await;
            if oa.matched_with.is_some() || ob.matched_with.is_some() {
                continue;
            }
            oa.matched_with = Some(ob.order_hash);
            ob.matched_with = Some(oa.order_hash);
            info!(
                a = %hex::encode(oa.order_hash),
                b = %hex::encode(ob.order_hash),
                "Matched crossed orders"
            );
            crate::metrics::record_match_found();
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    /// Drop terminal orders past the retention horizon
    pub fn gc(&self) {
        let retention = ChronoDuration::seconds(self.config.retention_secs as i64);
        let removed = self.store.gc_expired(retention, Utc::now());
        if !removed.is_empty() {
            info!(count = removed.len(), "Garbage collected terminal orders");
        }
    }

    // ------------------------------------------------------------------
    // Action workers
    // ------------------------------------------------------------------

    fn enqueue(&self, command: OrderCommand) {
        let name = command.action.name();
        match self.command_tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(
                    order_hash = %hex::encode(cmd.order_hash),
                    action = name,
                    "Command queue full, dropping action; sweep or reconciliation will retry"
                );
                crate::metrics::record_backpressure(cmd.chain_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(action = name, "Command queue closed, shutting down");
            }
        }
    }

    /// Spawn the worker pool consuming the command queue. May only be
    /// called once.
    pub async fn spawn_workers(self: Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.command_rx.lock().await.take() else {
            warn!("Worker pool already spawned, ignoring");
            return Vec::new();
        };
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            let resolver = self.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let command = { rx.lock().await.recv().await };
                    let Some(command) = command else {
                        debug!(worker_id, "Command queue closed, worker exiting");
                        break;
                    };
                    resolver.inflight.fetch_add(1, Ordering::Relaxed);
                    resolver.execute_command(command).await;
                    resolver.inflight.fetch_sub(1, Ordering::Relaxed);
                }
            }));
        }
        handles
    }

    async fn execute_command(&self, command: OrderCommand) {
        let adapter = match self.chains.get(command.chain_id) {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "Command targets unknown chain");
                return;
            }
        };

        match adapter.submit_and_confirm(&command.action).await {
            Ok(receipt) if receipt.success => {
                self.on_action_confirmed(&command, &receipt).await;
            }
            Ok(receipt) => {
                warn!(
                    order_hash = %hex::encode(command.order_hash),
                    action = command.action.name(),
                    tx_hash = %receipt.tx_hash,
                    "Submitted transaction reverted"
                );
                self.on_action_unwound(&command).await;
            }
            Err(e) => {
                self.on_action_failed(command, e).await;
            }
        }
    }

    async fn on_action_confirmed(&self, command: &OrderCommand, receipt: &SubmissionReceipt) {
        info!(
            order_hash = %hex::encode(command.order_hash),
            action = command.action.name(),
            block = receipt.block_number,
            "Action confirmed on chain"
        );

        if let ChainAction::RefundOrder { .. } | ChainAction::RefundHtlc { .. } = command.action {
            let Some(slot) = self.store.get(&command.order_hash) else {
                return;
            };
            let mut order = slot.lock().await;
            if command.chain_id != order.source_chain {
                return;
            }
            order.source_refunded = true;
            let now = Utc::now();
            order.updated_at = now;
            if !order.is_terminal() && order.transition(OrderState::Refunded, now).is_ok() {
                crate::metrics::record_order_transition(OrderState::Refunded.as_str());
                info!(
                    order_hash = %hex::encode(command.order_hash),
                    "Refund confirmed, order closed"
                );
                self.finalize_terminal(&order).await;
            }
        }
    }

    /// A reverted transaction leaves on-chain state unchanged; undo the
    /// in-memory markers so periodic passes can retry.
    async fn on_action_unwound(&self, command: &OrderCommand) {
        if let ChainAction::RefundOrder { .. } | ChainAction::RefundHtlc { .. } = command.action {
            if let Some(slot) = self.store.get(&command.order_hash) {
                let mut order = slot.lock().await;
                order.refund_submitted = false;
            }
        }
    }

    async fn on_action_failed(&self, command: OrderCommand, err: RelayerError) {
        error!(
            order_hash = %hex::encode(command.order_hash),
            action = command.action.name(),
            error = %err,
            "Action submission failed"
        );

        if matches!(err, RelayerError::SubmitExhausted { .. }) {
            if let Some(slot) = self.store.get(&command.order_hash) {
                let mut order = slot.lock().await;
                order.needs_attention = true;
                order.refund_submitted = false;
                order.updated_at = Utc::now();
            }
        }

        // Secret propagation keeps retrying until the counterparty's
        // timelock elapses or the HTLC resolves.
        if let ChainAction::ClaimHtlc { .. } = &command.action {
            self.maybe_requeue_claim(command).await;
        }
    }

    async fn maybe_requeue_claim(&self, mut command: OrderCommand) {
        let Some(slot) = self.store.get(&command.order_hash) else {
            return;
        };
        let still_live = {
            let order = slot.lock().await;
            if order.halted {
                return;
            }
            order
                .htlc_on(command.chain_id)
                .map(|h| {
                    h.phase == HtlcPhase::Locked
                        && (Utc::now().timestamp() as u64) < h.timelock
                })
                .unwrap_or(false)
        };
        if !still_live {
            return;
        }

        command.attempt += 1;
        let delay = Duration::from_secs(
            self.config
                .retry_base_delay_secs
                .saturating_mul(2u64.saturating_pow(command.attempt.min(6))),
        );
        debug!(
            order_hash = %hex::encode(command.order_hash),
            attempt = command.attempt,
            delay_secs = delay.as_secs(),
            "Requeueing claim after failure"
        );
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command).await;
        });
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> OrderStats {
        let stats = self.store.stats().await;
        for (state, count) in &stats.by_state {
            crate::metrics::set_orders_gauge(state, *count);
        }
        stats
    }
}

/// Helpers shared with the HTTP surface
pub fn parse_order_hash(input: &str) -> RelayerResult<OrderHash> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(stripped)
        .map_err(|e| RelayerError::Internal(format!("invalid order hash: {}", e)))?;
    if bytes.len() != 32 {
        return Err(RelayerError::Internal(format!(
            "order hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

pub fn parse_secret(input: &str) -> RelayerResult<Secret> {
    parse_order_hash(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_hash_parsing() {
        let hash = parse_order_hash(&format!("0x{}", "ab".repeat(32))).unwrap();
        assert_eq!(hash, [0xab; 32]);

        let bare = parse_order_hash(&"cd".repeat(32)).unwrap();
        assert_eq!(bare, [0xcd; 32]);

        assert!(parse_order_hash("0x1234").is_err());
        assert!(parse_order_hash("zz").is_err());
    }
}
