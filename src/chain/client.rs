//! Chain client capability interface and its EVM implementation
//!
//! `ChainClient` is the seam between the relayer and a ledger: the
//! adapter layers policy (finality, windows, retry, fees) on top of
//! it, and tests substitute a scripted client. `EvmChainClient` is the
//! production implementation over ethers with multi-RPC failover.

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainEvent, EventDecoder};
use crate::resolver::order::{ChainId, Hashlock, HtlcId, HtlcPhase, OrderHash, Secret};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Action the resolver can submit to a chain
#[derive(Debug, Clone, PartialEq)]
pub enum ChainAction {
    CreateHtlc {
        receiver: Address,
        hashlock: Hashlock,
        timelock: u64,
        token: Address,
        amount: U256,
    },
    ClaimHtlc {
        htlc_id: HtlcId,
        secret: Secret,
    },
    RefundHtlc {
        htlc_id: HtlcId,
    },
    ProcessIncomingOrder {
        order_hash: OrderHash,
        receiver: Address,
        token_out: Address,
        amount_out: U256,
        hashlock: Hashlock,
        timelock: u64,
    },
    FulfillIncomingOrder {
        order_hash: OrderHash,
        secret: Secret,
    },
    RefundOrder {
        order_hash: OrderHash,
    },
}

impl ChainAction {
    /// Action name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ChainAction::CreateHtlc { .. } => "create_htlc",
            ChainAction::ClaimHtlc { .. } => "claim_htlc",
            ChainAction::RefundHtlc { .. } => "refund_htlc",
            ChainAction::ProcessIncomingOrder { .. } => "process_incoming_order",
            ChainAction::FulfillIncomingOrder { .. } => "fulfill_incoming_order",
            ChainAction::RefundOrder { .. } => "refund_order",
        }
    }

    /// Whether this action targets the HTLC contract (vs the bridge)
    pub fn targets_htlc(&self) -> bool {
        matches!(
            self,
            ChainAction::CreateHtlc { .. }
                | ChainAction::ClaimHtlc { .. }
                | ChainAction::RefundHtlc { .. }
        )
    }

    /// Native value attached to the submission
    pub fn value(&self) -> U256 {
        match self {
            ChainAction::CreateHtlc { token, amount, .. } if token.is_zero() => *amount,
            _ => U256::zero(),
        }
    }
}

/// Chain fee quote; refreshed on a timer, stale values are acceptable
#[derive(Debug, Clone)]
pub enum FeeQuote {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Outcome of a submitted transaction
#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub success: bool,
}

/// Authoritative bridge-side order state, used by reconciliation
#[derive(Debug, Clone)]
pub struct OrderView {
    pub funded: bool,
    pub fulfilled: bool,
    pub refunded: bool,
    pub secret: Option<Secret>,
}

/// Authoritative HTLC state, used by reconciliation
#[derive(Debug, Clone)]
pub struct HtlcView {
    pub phase: HtlcPhase,
    pub amount: U256,
    pub hashlock: Hashlock,
    pub timelock: u64,
    pub secret: Option<Secret>,
}

/// Capability set a ledger exposes to the relayer
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Address the relayer submits from on this chain; HTLCs with this
    /// receiver are claimable by us
    fn relayer_address(&self) -> Address;

    /// Latest block height at the tip
    async fn tip_height(&self) -> RelayerResult<u64>;

    /// Decoded contract events in an inclusive block range, ordered by
    /// `(block_number, log_index)`
    async fn query_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>>;

    /// Estimate gas for an action
    async fn estimate_gas(&self, action: &ChainAction) -> RelayerResult<U256>;

    /// Sign and submit an action; returns the transaction hash
    async fn submit(
        &self,
        action: &ChainAction,
        gas_limit: U256,
        fee: &FeeQuote,
    ) -> RelayerResult<H256>;

    /// Receipt for a submitted transaction, if mined
    async fn tx_receipt(&self, tx_hash: H256) -> RelayerResult<Option<SubmissionReceipt>>;

    /// Current fee quote from the chain's fee oracle
    async fn fee_quote(&self) -> RelayerResult<FeeQuote>;

    /// Bridge view of an order
    async fn order_view(&self, order_hash: OrderHash) -> RelayerResult<Option<OrderView>>;

    /// HTLC contract view of an escrow
    async fn htlc_view(&self, htlc_id: HtlcId) -> RelayerResult<Option<HtlcView>>;
}

/// Production EVM client with multi-RPC failover
pub struct EvmChainClient {
    config: ChainConfig,
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
    wallet: LocalWallet,
    htlc_address: Address,
    bridge_address: Address,
    decoder: EventDecoder,
}

impl EvmChainClient {
    pub fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added RPC provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }
        if providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let key = std::env::var(&config.submission_key_env).map_err(|_| {
            RelayerError::Wallet(format!(
                "submission key env var {} is not set",
                config.submission_key_env
            ))
        })?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid submission key: {}", e)))?
            .with_chain_id(config.chain_id);

        let htlc_address = Address::from_str(&config.htlc_address)
            .map_err(|e| RelayerError::Config(format!("Invalid HTLC address: {}", e)))?;
        let bridge_address = Address::from_str(&config.bridge_address)
            .map_err(|e| RelayerError::Config(format!("Invalid bridge address: {}", e)))?;

        let decoder = EventDecoder::new(config.chain_id, htlc_address, bridge_address);

        Ok(Self {
            config,
            providers,
            current_provider: AtomicUsize::new(0),
            wallet,
            htlc_address,
            bridge_address,
            decoder,
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!(
            "Chain {} failover to provider {}",
            self.config.chain_id, next
        );
    }

    fn connection_err(&self, message: impl Into<String>) -> RelayerError {
        RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.into(),
        }
    }

    fn action_target(&self, action: &ChainAction) -> Address {
        if action.targets_htlc() {
            self.htlc_address
        } else {
            self.bridge_address
        }
    }

    /// ABI-encode the calldata for an action
    fn encode_calldata(action: &ChainAction) -> Vec<u8> {
        let mut data = Vec::new();
        match action {
            ChainAction::CreateHtlc {
                receiver,
                hashlock,
                timelock,
                token,
                amount,
            } => {
                data.extend_from_slice(&selector(
                    "create(address,bytes32,uint256,address,uint256)",
                ));
                data.extend_from_slice(&address_word(*receiver));
                data.extend_from_slice(hashlock);
                data.extend_from_slice(&u64_word(*timelock));
                data.extend_from_slice(&address_word(*token));
                data.extend_from_slice(&u256_word(*amount));
            }
            ChainAction::ClaimHtlc { htlc_id, secret } => {
                data.extend_from_slice(&selector("claim(bytes32,bytes32)"));
                data.extend_from_slice(htlc_id);
                data.extend_from_slice(secret);
            }
            ChainAction::RefundHtlc { htlc_id } => {
                data.extend_from_slice(&selector("refund(bytes32)"));
                data.extend_from_slice(htlc_id);
            }
            ChainAction::ProcessIncomingOrder {
                order_hash,
                receiver,
                token_out,
                amount_out,
                hashlock,
                timelock,
            } => {
                data.extend_from_slice(&selector(
                    "processIncomingOrder(bytes32,address,address,uint256,bytes32,uint256)",
                ));
                data.extend_from_slice(order_hash);
                data.extend_from_slice(&address_word(*receiver));
                data.extend_from_slice(&address_word(*token_out));
                data.extend_from_slice(&u256_word(*amount_out));
                data.extend_from_slice(hashlock);
                data.extend_from_slice(&u64_word(*timelock));
            }
            ChainAction::FulfillIncomingOrder { order_hash, secret } => {
                data.extend_from_slice(&selector("fulfillIncomingOrder(bytes32,bytes32)"));
                data.extend_from_slice(order_hash);
                data.extend_from_slice(secret);
            }
            ChainAction::RefundOrder { order_hash } => {
                data.extend_from_slice(&selector("refund(bytes32)"));
                data.extend_from_slice(order_hash);
            }
        }
        data
    }

    fn build_tx(
        &self,
        action: &ChainAction,
        gas_limit: U256,
        fee: &FeeQuote,
    ) -> TypedTransaction {
        let to = self.action_target(action);
        let data = Self::encode_calldata(action);
        let value = action.value();

        match fee {
            FeeQuote::Legacy(price) => {
                let tx = TransactionRequest::new()
                    .to(to)
                    .data(data)
                    .value(value)
                    .gas(gas_limit)
                    .gas_price(*price)
                    .from(self.wallet.address());
                TypedTransaction::Legacy(tx)
            }
            FeeQuote::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let tx = Eip1559TransactionRequest::new()
                    .to(to)
                    .data(data)
                    .value(value)
                    .gas(gas_limit)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .from(self.wallet.address());
                TypedTransaction::Eip1559(tx)
            }
        }
    }

    async fn eth_call(&self, to: Address, data: Vec<u8>) -> RelayerResult<Vec<u8>> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        for _ in 0..self.providers.len() {
            match self.http().call(&tx, None).await {
                Ok(bytes) => return Ok(bytes.to_vec()),
                Err(e) => {
                    warn!(
                        "View call failed on chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }
        Err(self.connection_err("All providers failed view call"))
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> ChainId {
        self.config.chain_id
    }

    fn relayer_address(&self) -> Address {
        self.wallet.address()
    }

    async fn tip_height(&self) -> RelayerResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }
        Err(self.connection_err("All providers failed"))
    }

    async fn query_events(&self, from: u64, to: u64) -> RelayerResult<Vec<ChainEvent>> {
        let filter = Filter::new()
            .address(vec![self.htlc_address, self.bridge_address])
            .from_block(from)
            .to_block(to);

        let mut logs = None;
        for _ in 0..self.providers.len() {
            match self.http().get_logs(&filter).await {
                Ok(l) => {
                    logs = Some(l);
                    break;
                }
                Err(e) => {
                    warn!(
                        "Failed to get logs from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }
        let logs = logs.ok_or_else(|| self.connection_err("All providers failed to get logs"))?;

        let mut events = Vec::new();
        for log in &logs {
            if let Some(event) = self.decoder.decode_log(log)? {
                events.push(event);
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn estimate_gas(&self, action: &ChainAction) -> RelayerResult<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.action_target(action))
            .data(Self::encode_calldata(action))
            .value(action.value())
            .from(self.wallet.address())
            .into();
        self.http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))
    }

    async fn submit(
        &self,
        action: &ChainAction,
        gas_limit: U256,
        fee: &FeeQuote,
    ) -> RelayerResult<H256> {
        let mut tx = self.build_tx(action, gas_limit, fee);

        let nonce = self
            .http()
            .get_transaction_count(self.wallet.address(), None)
            .await
            .map_err(|e| self.connection_err(e.to_string()))?;
        tx.set_nonce(nonce);
        tx.set_chain_id(self.config.chain_id);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("insufficient funds") || msg.contains("nonce") {
                    RelayerError::Transaction(msg)
                } else {
                    self.connection_err(msg)
                }
            })?;

        Ok(pending.tx_hash())
    }

    async fn tx_receipt(&self, tx_hash: H256) -> RelayerResult<Option<SubmissionReceipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_err(e.to_string()))?;

        Ok(receipt.map(|r| SubmissionReceipt {
            tx_hash,
            block_number: r.block_number.map(|b| b.as_u64()).unwrap_or(0),
            success: r.status == Some(1.into()),
        }))
    }

    async fn fee_quote(&self) -> RelayerResult<FeeQuote> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                Ok(FeeQuote::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let block = self
                    .http()
                    .get_block(BlockNumber::Latest)
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?
                    .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;
                let base_fee = block.base_fee_per_gas.ok_or_else(|| {
                    RelayerError::GasEstimation("No base fee in block".to_string())
                })?;

                let priority_fee = U256::from(2_000_000_000u64);
                let max_fee = base_fee * 2 + priority_fee;

                // Cap at configured max
                let cap = U256::from(self.config.max_gas_price_gwei)
                    * U256::from(1_000_000_000u64);
                Ok(FeeQuote::Eip1559 {
                    max_fee_per_gas: std::cmp::min(max_fee, cap),
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn order_view(&self, order_hash: OrderHash) -> RelayerResult<Option<OrderView>> {
        let mut data = selector("getOrder(bytes32)").to_vec();
        data.extend_from_slice(&order_hash);
        let out = self.eth_call(self.bridge_address, data).await?;

        // Return layout: (uint8 status, bytes32 secret) as two words.
        // status: 0 = unknown, 1 = funded, 2 = fulfilled, 3 = refunded.
        if out.len() < 64 {
            return Err(RelayerError::Decode {
                chain_id: self.config.chain_id,
                block_number: 0,
                message: format!("getOrder returned {} bytes", out.len()),
            });
        }
        let status = out[31];
        if status == 0 {
            return Ok(None);
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&out[32..64]);
        Ok(Some(OrderView {
            funded: status >= 1,
            fulfilled: status == 2,
            refunded: status == 3,
            secret: if secret == [0u8; 32] { None } else { Some(secret) },
        }))
    }

    async fn htlc_view(&self, htlc_id: HtlcId) -> RelayerResult<Option<HtlcView>> {
        let mut data = selector("getHtlc(bytes32)").to_vec();
        data.extend_from_slice(&htlc_id);
        let out = self.eth_call(self.htlc_address, data).await?;

        // Return layout: (uint8 phase, uint256 amount, bytes32 hashlock,
        // uint256 timelock, bytes32 secret) as five words.
        // phase: 0 = empty, 1 = locked, 2 = claimed, 3 = refunded.
        if out.len() < 160 {
            return Err(RelayerError::Decode {
                chain_id: self.config.chain_id,
                block_number: 0,
                message: format!("getHtlc returned {} bytes", out.len()),
            });
        }
        let phase = match out[31] {
            0 => return Ok(None),
            1 => HtlcPhase::Locked,
            2 => HtlcPhase::Claimed,
            3 => HtlcPhase::Refunded,
            other => {
                return Err(RelayerError::Decode {
                    chain_id: self.config.chain_id,
                    block_number: 0,
                    message: format!("unknown HTLC phase {}", other),
                })
            }
        };
        let amount = U256::from_big_endian(&out[32..64]);
        let mut hashlock = [0u8; 32];
        hashlock.copy_from_slice(&out[64..96]);
        let timelock = U256::from_big_endian(&out[96..128]).as_u64();
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&out[128..160]);

        Ok(Some(HtlcView {
            phase,
            amount,
            hashlock,
            timelock,
            secret: if secret == [0u8; 32] { None } else { Some(secret) },
        }))
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn address_word(addr: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_bytes());
    word
}

fn u256_word(value: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

fn u64_word(value: u64) -> [u8; 32] {
    u256_word(U256::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_calldata_layout() {
        let action = ChainAction::ClaimHtlc {
            htlc_id: [0x42; 32],
            secret: [0x55; 32],
        };
        let data = EvmChainClient::encode_calldata(&action);
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[0..4], &selector("claim(bytes32,bytes32)"));
        assert_eq!(&data[4..36], &[0x42; 32]);
        assert_eq!(&data[36..68], &[0x55; 32]);
    }

    #[test]
    fn native_create_carries_value() {
        let action = ChainAction::CreateHtlc {
            receiver: Address::repeat_byte(1),
            hashlock: [0; 32],
            timelock: 100,
            token: Address::zero(),
            amount: U256::from(777),
        };
        assert_eq!(action.value(), U256::from(777));

        let erc20 = ChainAction::CreateHtlc {
            receiver: Address::repeat_byte(1),
            hashlock: [0; 32],
            timelock: 100,
            token: Address::repeat_byte(9),
            amount: U256::from(777),
        };
        assert_eq!(erc20.value(), U256::zero());
    }

    #[test]
    fn contract_routing() {
        let claim = ChainAction::ClaimHtlc {
            htlc_id: [0; 32],
            secret: [0; 32],
        };
        assert!(claim.targets_htlc());

        let refund = ChainAction::RefundOrder { order_hash: [0; 32] };
        assert!(!refund.targets_htlc());
    }
}
