//! Crossed-order matching pass
//!
//! Pairs outgoing orders with dual fingerprints: A offers on one chain
//! what B asks for on the other, with amounts crossed. Matching is an
//! optimization only; an unmatched order still fulfills manually.

use crate::resolver::order::{ChainId, OrderHash};

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};

/// Reduced view of an order used by the matcher
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub order_hash: OrderHash,
    pub source_chain: ChainId,
    pub target_chain: ChainId,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub amount_out: U256,
    pub timelock: u64,
    pub created_at: DateTime<Utc>,
}

/// Two orders match when their fingerprints cross exactly and both
/// timelocks leave room for the counter-leg.
fn crosses(a: &MatchCandidate, b: &MatchCandidate, now: u64, margin: u64) -> bool {
    a.source_chain == b.target_chain
        && a.target_chain == b.source_chain
        && a.token_in == b.token_out
        && a.token_out == b.token_in
        && a.amount_in == b.amount_out
        && a.amount_out == b.amount_in
        && compatible_timelocks(a.timelock, b.timelock, now, margin)
}

/// Both timelocks must exceed now by at least twice the safety margin,
/// so each side can still serve as the other's target leg.
fn compatible_timelocks(a: u64, b: u64, now: u64, margin: u64) -> bool {
    let floor = now.saturating_add(2 * margin);
    a >= floor && b >= floor
}

/// Pair crossed candidates, oldest first. Each candidate is used at
/// most once.
pub fn find_matches(
    candidates: &[MatchCandidate],
    now: u64,
    margin: u64,
) -> Vec<(OrderHash, OrderHash)> {
    let mut sorted: Vec<&MatchCandidate> = candidates.iter().collect();
    sorted.sort_by_key(|c| c.created_at);

    let mut taken = vec![false; sorted.len()];
    let mut pairs = Vec::new();

    for i in 0..sorted.len() {
        if taken[i] {
            continue;
        }
        for j in (i + 1)..sorted.len() {
            if taken[j] {
                continue;
            }
            if crosses(sorted[i], sorted[j], now, margin) {
                taken[i] = true;
                taken[j] = true;
                pairs.push((sorted[i].order_hash, sorted[j].order_hash));
                break;
            }
        }
    }

    pairs
}
