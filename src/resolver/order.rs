//! Cross-chain order model, state machine and hashlock arithmetic

use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type ChainId = u64;
pub type OrderHash = [u8; 32];
pub type HtlcId = [u8; 32];
pub type Hashlock = [u8; 32];
pub type Secret = [u8; 32];

/// Sentinel token address denoting the chain's native asset
pub fn native_token() -> Address {
    Address::zero()
}

/// Order lifecycle states. `Fulfilled`, `Refunded` and `Failed` are
/// terminal: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    SourceLocked,
    TargetLocked,
    Fulfilled,
    Refunded,
    Failed,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Fulfilled | OrderState::Refunded | OrderState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::SourceLocked => "source_locked",
            OrderState::TargetLocked => "target_locked",
            OrderState::Fulfilled => "fulfilled",
            OrderState::Refunded => "refunded",
            OrderState::Failed => "failed",
        }
    }

    /// Allowed edges of the state machine. The TargetLocked ->
    /// SourceLocked edge exists only for reconciliation reverts.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        match (self, next) {
            (Pending, SourceLocked) => true,
            (Pending, Failed) | (Pending, Refunded) => true,
            (SourceLocked, TargetLocked) => true,
            (SourceLocked, Failed) | (SourceLocked, Refunded) => true,
            (TargetLocked, Fulfilled) => true,
            (TargetLocked, Failed) | (TargetLocked, Refunded) => true,
            (TargetLocked, SourceLocked) => true,
            _ => false,
        }
    }
}

/// Phase of an on-chain HTLC, mirrored from chain events and views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcPhase {
    Locked,
    Claimed,
    Refunded,
}

/// Mirror of what the underlying chain holds for one HTLC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtlcState {
    pub htlc_id: HtlcId,
    pub sender: Address,
    pub receiver: Address,
    pub token: Address,
    pub amount: U256,
    pub hashlock: Hashlock,
    pub timelock: u64,
    pub phase: HtlcPhase,
}

/// The unit of coordination: one swap intent observed on the source
/// chain, driven through the HTLC protocol by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainOrder {
    pub order_hash: OrderHash,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
    pub maker: Address,
    pub receiver: Address,
    pub hashlock: Hashlock,
    /// Absolute source-chain deadline, unix seconds
    pub timelock: u64,
    /// Target-side deadline once the target HTLC is observed
    pub target_timelock: Option<u64>,
    pub state: OrderState,
    pub source_htlc: Option<HtlcState>,
    pub target_htlc: Option<HtlcState>,
    /// Revealed secret; learned only from HtlcClaimed observations
    pub secret: Option<Secret>,
    pub source_claimed: bool,
    pub target_claimed: bool,
    pub source_refunded: bool,
    pub target_refunded: bool,
    /// Set when submission retries were exhausted; non-terminal
    pub needs_attention: bool,
    /// Set when reconciliation found a breach requiring operator
    /// action; automatic submissions stop for this order
    pub halted: bool,
    /// A refund submission is in flight; cleared if it fails
    pub refund_submitted: bool,
    /// Counter-order paired by the matching pass, if any
    pub matched_with: Option<OrderHash>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrossChainOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_hash: OrderHash,
        source_chain: ChainId,
        target_chain: ChainId,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out: U256,
        maker: Address,
        receiver: Address,
        hashlock: Hashlock,
        timelock: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_hash,
            source_chain,
            target_chain,
            token_in,
            token_out,
            amount_in,
            amount_out,
            maker,
            receiver,
            hashlock,
            timelock,
            target_timelock: None,
            state: OrderState::Pending,
            source_htlc: None,
            target_htlc: None,
            secret: None,
            source_claimed: false,
            target_claimed: false,
            source_refunded: false,
            target_refunded: false,
            needs_attention: false,
            halted: false,
            refund_submitted: false,
            matched_with: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state transition, rejecting edges the machine does not
    /// allow. Terminal states never transition.
    pub fn transition(&mut self, next: OrderState, now: DateTime<Utc>) -> RelayerResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The HTLC mirror for the given chain, if observed
    pub fn htlc_on(&self, chain_id: ChainId) -> Option<&HtlcState> {
        if chain_id == self.source_chain {
            self.source_htlc.as_ref()
        } else if chain_id == self.target_chain {
            self.target_htlc.as_ref()
        } else {
            None
        }
    }

    /// Whether the source timelock has elapsed at `now` (unix seconds)
    pub fn source_expired(&self, now: u64) -> bool {
        now >= self.timelock
    }
}

/// SHA-256 hashlock of a secret
pub fn hashlock_of(secret: &Secret) -> Hashlock {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.finalize().into()
}

/// Verify that a secret opens a hashlock
pub fn secret_matches(secret: &Secret, hashlock: &Hashlock) -> bool {
    hashlock_of(secret) == *hashlock
}

/// Generate a cryptographically random 32-byte secret
pub fn generate_secret() -> Secret {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

/// Deterministic order hash over the immutable order fields
#[allow(clippy::too_many_arguments)]
pub fn derive_order_hash(
    source_chain: ChainId,
    target_chain: ChainId,
    maker: Address,
    receiver: Address,
    token_in: Address,
    token_out: Address,
    amount_in: U256,
    amount_out: U256,
    hashlock: &Hashlock,
    timelock: u64,
) -> OrderHash {
    let mut buf = Vec::with_capacity(32 * 10);
    let mut word = [0u8; 32];

    U256::from(source_chain).to_big_endian(&mut word);
    buf.extend_from_slice(&word);
    U256::from(target_chain).to_big_endian(&mut word);
    buf.extend_from_slice(&word);
    buf.extend_from_slice(&address_word(maker));
    buf.extend_from_slice(&address_word(receiver));
    buf.extend_from_slice(&address_word(token_in));
    buf.extend_from_slice(&address_word(token_out));
    amount_in.to_big_endian(&mut word);
    buf.extend_from_slice(&word);
    amount_out.to_big_endian(&mut word);
    buf.extend_from_slice(&word);
    buf.extend_from_slice(hashlock);
    U256::from(timelock).to_big_endian(&mut word);
    buf.extend_from_slice(&word);

    keccak256(buf)
}

fn address_word(addr: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_bytes());
    word
}

/// Validate a source timelock against the configured bounds at order
/// creation time
pub fn validate_timelock_bounds(
    timelock: u64,
    now: u64,
    min_secs: u64,
    max_secs: u64,
) -> RelayerResult<()> {
    if timelock <= now || timelock - now < min_secs || timelock - now > max_secs {
        return Err(RelayerError::Config(format!(
            "timelock {} outside [{}s, {}s] from now {}",
            timelock, min_secs, max_secs, now
        )));
    }
    Ok(())
}

/// Invariant I2: the target HTLC must expire at least `margin` seconds
/// before the source HTLC
pub fn validate_timelock_skew(
    source_timelock: u64,
    target_timelock: u64,
    margin: u64,
) -> RelayerResult<()> {
    if target_timelock.saturating_add(margin) > source_timelock {
        return Err(RelayerError::InvariantBreach {
            order_hash: String::new(),
            message: format!(
                "timelock skew violated: target {} + margin {} exceeds source {}",
                target_timelock, margin, source_timelock
            ),
        });
    }
    Ok(())
}
