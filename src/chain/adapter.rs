//! Chain adapter: policy layer over a `ChainClient`
//!
//! Enforces the finality depth, the event-query window, per-call
//! deadlines, the submission retry/backoff policy, the concurrent
//! submission cap and the cached fee quote.

use crate::chain::client::{
    ChainAction, ChainClient, FeeQuote, HtlcView, OrderView, SubmissionReceipt,
};
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainEvent;
use crate::resolver::order::{ChainId, HtlcId, OrderHash};

use ethers::types::{H256, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Exponential backoff for submission retries (base * 2^attempt)
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u64.saturating_pow(self.attempt);
        let delay = self
            .base
            .saturating_mul(factor.min(u32::MAX as u64) as u32)
            .min(self.max);
        self.attempt += 1;
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Static policy knobs, derived from configuration
#[derive(Debug, Clone)]
pub struct AdapterPolicy {
    pub confirmation_depth: u64,
    pub max_blocks_per_query: u64,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub query_deadline: Duration,
    pub receipt_deadline: Duration,
    pub min_gas_limit: u64,
    pub max_inflight_submissions: usize,
}

impl Default for AdapterPolicy {
    fn default() -> Self {
        Self {
            confirmation_depth: 3,
            max_blocks_per_query: 100,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(5),
            query_deadline: Duration::from_secs(30),
            receipt_deadline: Duration::from_secs(120),
            min_gas_limit: 100_000,
            max_inflight_submissions: 16,
        }
    }
}

/// Uniform façade over one ledger
pub struct ChainAdapter {
    chain_id: ChainId,
    name: String,
    client: Arc<dyn ChainClient>,
    policy: AdapterPolicy,
    supports_incoming_orders: bool,
    /// Last known fee quote; written only by the fee-refresh task
    fee_quote: RwLock<Option<FeeQuote>>,
    /// Concurrent submission cap
    submission_permits: Semaphore,
    /// Highest confirmed height seen, for health checks
    last_confirmed: AtomicU64,
}

impl ChainAdapter {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ChainClient>,
        policy: AdapterPolicy,
        supports_incoming_orders: bool,
    ) -> Self {
        let chain_id = client.chain_id();
        Self {
            chain_id,
            name: name.into(),
            client,
            supports_incoming_orders,
            submission_permits: Semaphore::new(policy.max_inflight_submissions),
            policy,
            fee_quote: RwLock::new(None),
            last_confirmed: AtomicU64::new(0),
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_incoming_orders(&self) -> bool {
        self.supports_incoming_orders
    }

    /// Address this relayer submits from on this chain
    pub fn relayer_address(&self) -> ethers::types::Address {
        self.client.relayer_address()
    }

    pub fn max_blocks_per_query(&self) -> u64 {
        self.policy.max_blocks_per_query
    }

    async fn with_deadline<T>(
        &self,
        operation: &str,
        deadline: Duration,
        fut: impl std::future::Future<Output = RelayerResult<T>>,
    ) -> RelayerResult<T> {
        match timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(RelayerError::Timeout {
                operation: format!("{} on chain {}", operation, self.chain_id),
            }),
        }
    }

    /// Height of the chain tip
    pub async fn tip_height(&self) -> RelayerResult<u64> {
        self.with_deadline("tip_height", self.policy.query_deadline, self.client.tip_height())
            .await
    }

    /// Highest block considered final: tip minus the confirmation depth
    pub async fn confirmed_height(&self) -> RelayerResult<u64> {
        let tip = self.tip_height().await?;
        let confirmed = tip.saturating_sub(self.policy.confirmation_depth);
        self.last_confirmed
            .fetch_max(confirmed, Ordering::Relaxed);
        Ok(confirmed)
    }

    /// Query decoded events in `[from, to]`. The window is clamped to
    /// the configured maximum regardless of what the caller asks for.
    pub async fn query_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        if to < from {
            return Ok(Vec::new());
        }
        let clamped_to = to.min(from + self.policy.max_blocks_per_query - 1);
        if clamped_to < to {
            debug!(
                chain_id = self.chain_id,
                from, to, clamped_to, "Clamped event query window"
            );
        }
        self.with_deadline(
            "query_events",
            self.policy.query_deadline,
            self.client.query_events(from, clamped_to),
        )
        .await
    }

    /// Submit an action with the full retry policy. Transient failures
    /// are retried with exponential backoff; exhaustion surfaces as
    /// `SubmitExhausted`.
    pub async fn submit(&self, action: &ChainAction) -> RelayerResult<H256> {
        let _permit = self
            .submission_permits
            .acquire()
            .await
            .map_err(|_| RelayerError::Internal("submission semaphore closed".to_string()))?;

        let gas_limit = self.gas_limit_for(action).await;
        let mut backoff =
            ExponentialBackoff::new(self.policy.retry_base_delay, Duration::from_secs(60));
        let mut last_error: Option<RelayerError> = None;

        for attempt in 1..=self.policy.retry_attempts {
            let fee = self.current_fee_quote().await;

            let result = self
                .with_deadline(
                    "submit",
                    self.policy.query_deadline,
                    self.client.submit(action, gas_limit, &fee),
                )
                .await;

            match result {
                Ok(tx_hash) => {
                    info!(
                        chain_id = self.chain_id,
                        action = action.name(),
                        tx_hash = %tx_hash,
                        attempt,
                        "Submitted transaction"
                    );
                    crate::metrics::record_tx_submitted(self.chain_id, action.name());
                    return Ok(tx_hash);
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        chain_id = self.chain_id,
                        action = action.name(),
                        attempt,
                        error = %e,
                        "Submission attempt failed"
                    );
                    crate::metrics::record_submit_retry(self.chain_id);
                    last_error = Some(e);
                    if attempt < self.policy.retry_attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
                Err(e) => {
                    crate::metrics::record_tx_failed(self.chain_id, action.name());
                    return Err(e);
                }
            }
        }

        crate::metrics::record_tx_failed(self.chain_id, action.name());
        Err(RelayerError::SubmitExhausted {
            chain_id: self.chain_id,
            attempts: self.policy.retry_attempts,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Poll for the receipt of a submitted transaction until the
    /// receipt deadline elapses
    pub async fn wait_for_receipt(&self, tx_hash: H256) -> RelayerResult<SubmissionReceipt> {
        let deadline = tokio::time::Instant::now() + self.policy.receipt_deadline;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("receipt for {:?} on chain {}", tx_hash, self.chain_id),
                });
            }
            match self.client.tx_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    debug!(chain_id = self.chain_id, error = %e, "Receipt poll failed");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Submit and wait for inclusion
    pub async fn submit_and_confirm(
        &self,
        action: &ChainAction,
    ) -> RelayerResult<SubmissionReceipt> {
        let tx_hash = self.submit(action).await?;
        self.wait_for_receipt(tx_hash).await
    }

    /// Refresh the cached fee quote. On failure the prior value is
    /// retained.
    pub async fn refresh_fee_quote(&self) {
        match self
            .with_deadline("fee_quote", self.policy.query_deadline, self.client.fee_quote())
            .await
        {
            Ok(quote) => {
                debug!(chain_id = self.chain_id, "Refreshed fee quote");
                *self.fee_quote.write().await = Some(quote);
            }
            Err(e) => {
                warn!(
                    chain_id = self.chain_id,
                    error = %e,
                    "Fee quote refresh failed, keeping prior value"
                );
            }
        }
    }

    /// Last cached fee quote, or a conservative legacy default if no
    /// refresh has succeeded yet
    pub async fn current_fee_quote(&self) -> FeeQuote {
        self.fee_quote
            .read()
            .await
            .clone()
            .unwrap_or(FeeQuote::Legacy(U256::from(20_000_000_000u64)))
    }

    async fn gas_limit_for(&self, action: &ChainAction) -> U256 {
        let floor = U256::from(self.policy.min_gas_limit);
        match self.client.estimate_gas(action).await {
            // 1.2x the estimate, floored at the configured minimum
            Ok(estimate) => std::cmp::max(estimate * 12 / 10, floor),
            Err(e) => {
                debug!(
                    chain_id = self.chain_id,
                    error = %e,
                    "Gas estimation failed, using minimum"
                );
                floor
            }
        }
    }

    /// Bridge view of an order (reconciliation)
    pub async fn order_view(&self, order_hash: OrderHash) -> RelayerResult<Option<OrderView>> {
        self.with_deadline(
            "order_view",
            self.policy.query_deadline,
            self.client.order_view(order_hash),
        )
        .await
    }

    /// HTLC view of an escrow (reconciliation)
    pub async fn htlc_view(&self, htlc_id: HtlcId) -> RelayerResult<Option<HtlcView>> {
        self.with_deadline(
            "htlc_view",
            self.policy.query_deadline,
            self.client.htlc_view(htlc_id),
        )
        .await
    }

    /// Health: the confirmed height responds and moves forward
    pub async fn health_check(&self) -> bool {
        let before = self.last_confirmed.load(Ordering::Relaxed);
        match self.confirmed_height().await {
            Ok(now) => {
                let healthy = now >= before;
                crate::metrics::record_chain_health(self.chain_id, healthy);
                healthy
            }
            Err(e) => {
                warn!(chain_id = self.chain_id, error = %e, "Health check failed");
                crate::metrics::record_chain_health(self.chain_id, false);
                false
            }
        }
    }
}
