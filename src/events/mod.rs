//! Normalized chain events and EVM log decoding
//!
//! Events from both chains are reduced to a chain-agnostic form; the
//! tuple `(chain_id, tx_hash, log_index)` is a stable total order
//! within a chain and the dedup key across redeliveries.

use crate::error::{RelayerError, RelayerResult};
use crate::resolver::order::{ChainId, Hashlock, HtlcId, OrderHash, Secret};

use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Dedup key: stable identity of one log on one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: ChainId,
    pub tx_hash: H256,
    pub log_index: u64,
}

/// A normalized event observed at a confirmed block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain_id: ChainId,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
    pub payload: EventPayload,
}

impl ChainEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    /// Event name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            EventPayload::OrderCreated { .. } => "order_created",
            EventPayload::OrderFulfilled { .. } => "order_fulfilled",
            EventPayload::OrderRefunded { .. } => "order_refunded",
            EventPayload::HtlcCreated { .. } => "htlc_created",
            EventPayload::HtlcClaimed { .. } => "htlc_claimed",
            EventPayload::HtlcRefunded { .. } => "htlc_refunded",
        }
    }
}

/// Kind-specific payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    OrderCreated {
        order_hash: OrderHash,
        maker: Address,
        receiver: Address,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        amount_out: U256,
        hashlock: Hashlock,
        timelock: u64,
        target_chain_id: ChainId,
    },
    OrderFulfilled {
        order_hash: OrderHash,
        secret: Secret,
    },
    OrderRefunded {
        order_hash: OrderHash,
    },
    HtlcCreated {
        htlc_id: HtlcId,
        sender: Address,
        receiver: Address,
        token: Address,
        amount: U256,
        hashlock: Hashlock,
        timelock: u64,
    },
    HtlcClaimed {
        htlc_id: HtlcId,
        secret: Secret,
    },
    HtlcRefunded {
        htlc_id: HtlcId,
    },
}

/// Event topic signatures (keccak256 of the canonical event signature)
pub mod topics {
    use super::*;

    lazy_static! {
        pub static ref ORDER_CREATED: H256 = H256::from(keccak256(
            "OrderCreated(bytes32,address,address,address,address,uint256,uint256,bytes32,uint256,uint256)"
        ));
        pub static ref ORDER_FULFILLED: H256 =
            H256::from(keccak256("OrderFulfilled(bytes32,bytes32)"));
        pub static ref ORDER_REFUNDED: H256 =
            H256::from(keccak256("OrderRefunded(bytes32)"));
        pub static ref HTLC_CREATED: H256 = H256::from(keccak256(
            "HTLCCreated(bytes32,address,address,address,uint256,bytes32,uint256)"
        ));
        pub static ref HTLC_CLAIMED: H256 =
            H256::from(keccak256("HTLCClaimed(bytes32,bytes32)"));
        pub static ref HTLC_REFUNDED: H256 =
            H256::from(keccak256("HTLCRefunded(bytes32)"));
    }
}

/// Decoder for HTLC and bridge contract logs on one chain
pub struct EventDecoder {
    chain_id: ChainId,
    htlc_address: Address,
    bridge_address: Address,
}

impl EventDecoder {
    pub fn new(chain_id: ChainId, htlc_address: Address, bridge_address: Address) -> Self {
        Self {
            chain_id,
            htlc_address,
            bridge_address,
        }
    }

    /// Decode one log. Returns `Ok(None)` for logs from other
    /// contracts or unknown topics; a malformed log with a known topic
    /// is a `Decode` error and must not be skipped silently.
    pub fn decode_log(&self, log: &Log) -> RelayerResult<Option<ChainEvent>> {
        if log.address != self.htlc_address && log.address != self.bridge_address {
            return Ok(None);
        }

        let block_number = log
            .block_number
            .map(|b| b.as_u64())
            .ok_or_else(|| self.decode_err(0, "log missing block number"))?;
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| self.decode_err(block_number, "log missing transaction hash"))?;
        let log_index = log
            .log_index
            .map(|i| i.as_u64())
            .ok_or_else(|| self.decode_err(block_number, "log missing log index"))?;

        let topic0 = match log.topics.first() {
            Some(t) => *t,
            None => return Ok(None),
        };

        let payload = if topic0 == *topics::ORDER_CREATED {
            Some(self.decode_order_created(log, block_number)?)
        } else if topic0 == *topics::ORDER_FULFILLED {
            Some(EventPayload::OrderFulfilled {
                order_hash: self.indexed_word(log, 1, block_number)?,
                secret: self.data_word(log, 0, block_number)?,
            })
        } else if topic0 == *topics::ORDER_REFUNDED {
            Some(EventPayload::OrderRefunded {
                order_hash: self.indexed_word(log, 1, block_number)?,
            })
        } else if topic0 == *topics::HTLC_CREATED {
            Some(self.decode_htlc_created(log, block_number)?)
        } else if topic0 == *topics::HTLC_CLAIMED {
            Some(EventPayload::HtlcClaimed {
                htlc_id: self.indexed_word(log, 1, block_number)?,
                secret: self.data_word(log, 0, block_number)?,
            })
        } else if topic0 == *topics::HTLC_REFUNDED {
            Some(EventPayload::HtlcRefunded {
                htlc_id: self.indexed_word(log, 1, block_number)?,
            })
        } else {
            None
        };

        Ok(payload.map(|payload| ChainEvent {
            chain_id: self.chain_id,
            block_number,
            tx_hash,
            log_index,
            payload,
        }))
    }

    fn decode_order_created(&self, log: &Log, block: u64) -> RelayerResult<EventPayload> {
        // indexed: orderHash, maker; data: receiver, tokenIn, tokenOut,
        // amountIn, amountOut, hashlock, timelock, targetChainId
        Ok(EventPayload::OrderCreated {
            order_hash: self.indexed_word(log, 1, block)?,
            maker: self.indexed_address(log, 2, block)?,
            receiver: self.data_address(log, 0, block)?,
            token_in: self.data_address(log, 1, block)?,
            token_out: self.data_address(log, 2, block)?,
            amount_in: self.data_u256(log, 3, block)?,
            amount_out: self.data_u256(log, 4, block)?,
            hashlock: self.data_word(log, 5, block)?,
            timelock: self.data_u64(log, 6, block)?,
            target_chain_id: self.data_u64(log, 7, block)?,
        })
    }

    fn decode_htlc_created(&self, log: &Log, block: u64) -> RelayerResult<EventPayload> {
        // indexed: htlcId, sender; data: receiver, token, amount,
        // hashlock, timelock
        Ok(EventPayload::HtlcCreated {
            htlc_id: self.indexed_word(log, 1, block)?,
            sender: self.indexed_address(log, 2, block)?,
            receiver: self.data_address(log, 0, block)?,
            token: self.data_address(log, 1, block)?,
            amount: self.data_u256(log, 2, block)?,
            hashlock: self.data_word(log, 3, block)?,
            timelock: self.data_u64(log, 4, block)?,
        })
    }

    fn indexed_word(&self, log: &Log, idx: usize, block: u64) -> RelayerResult<[u8; 32]> {
        log.topics
            .get(idx)
            .map(|t| t.0)
            .ok_or_else(|| self.decode_err(block, &format!("missing indexed topic {}", idx)))
    }

    fn indexed_address(&self, log: &Log, idx: usize, block: u64) -> RelayerResult<Address> {
        let word = self.indexed_word(log, idx, block)?;
        Ok(Address::from_slice(&word[12..]))
    }

    fn data_word(&self, log: &Log, word_idx: usize, block: u64) -> RelayerResult<[u8; 32]> {
        let start = word_idx * 32;
        let end = start + 32;
        if log.data.len() < end {
            return Err(self.decode_err(
                block,
                &format!(
                    "log data too short: {} bytes, word {} needs {}",
                    log.data.len(),
                    word_idx,
                    end
                ),
            ));
        }
        let mut word = [0u8; 32];
        word.copy_from_slice(&log.data[start..end]);
        Ok(word)
    }

    fn data_address(&self, log: &Log, word_idx: usize, block: u64) -> RelayerResult<Address> {
        let word = self.data_word(log, word_idx, block)?;
        Ok(Address::from_slice(&word[12..]))
    }

    fn data_u256(&self, log: &Log, word_idx: usize, block: u64) -> RelayerResult<U256> {
        Ok(U256::from_big_endian(&self.data_word(log, word_idx, block)?))
    }

    fn data_u64(&self, log: &Log, word_idx: usize, block: u64) -> RelayerResult<u64> {
        let value = self.data_u256(log, word_idx, block)?;
        if value > U256::from(u64::MAX) {
            return Err(self.decode_err(block, "uint value exceeds u64 range"));
        }
        Ok(value.as_u64())
    }

    fn decode_err(&self, block_number: u64, message: &str) -> RelayerError {
        RelayerError::Decode {
            chain_id: self.chain_id,
            block_number,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn htlc_addr() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn bridge_addr() -> Address {
        Address::repeat_byte(0xbb)
    }

    fn decoder() -> EventDecoder {
        EventDecoder::new(1, htlc_addr(), bridge_addr())
    }

    fn base_log(address: Address, topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            address,
            topics,
            data: Bytes::from(data),
            block_number: Some(100.into()),
            transaction_hash: Some(H256::repeat_byte(0x01)),
            log_index: Some(3.into()),
            ..Default::default()
        }
    }

    fn word_of_u64(v: u64) -> [u8; 32] {
        let mut w = [0u8; 32];
        U256::from(v).to_big_endian(&mut w);
        w
    }

    fn word_of_addr(a: Address) -> [u8; 32] {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(a.as_bytes());
        w
    }

    #[test]
    fn decodes_htlc_claimed() {
        let htlc_id = H256::repeat_byte(0x42);
        let secret = [0x55u8; 32];
        let log = base_log(
            htlc_addr(),
            vec![*topics::HTLC_CLAIMED, htlc_id],
            secret.to_vec(),
        );

        let event = decoder().decode_log(&log).unwrap().unwrap();
        assert_eq!(event.chain_id, 1);
        assert_eq!(event.block_number, 100);
        assert_eq!(event.log_index, 3);
        match event.payload {
            EventPayload::HtlcClaimed {
                htlc_id: id,
                secret: s,
            } => {
                assert_eq!(id, htlc_id.0);
                assert_eq!(s, secret);
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn decodes_htlc_created() {
        let receiver = Address::repeat_byte(0x22);
        let token = Address::zero();
        let mut data = Vec::new();
        data.extend_from_slice(&word_of_addr(receiver));
        data.extend_from_slice(&word_of_addr(token));
        data.extend_from_slice(&word_of_u64(1_000));
        data.extend_from_slice(&[0xcd; 32]);
        data.extend_from_slice(&word_of_u64(2_000_000));

        let log = base_log(
            htlc_addr(),
            vec![
                *topics::HTLC_CREATED,
                H256::repeat_byte(0x42),
                H256::from(word_of_addr(Address::repeat_byte(0x11))),
            ],
            data,
        );

        let event = decoder().decode_log(&log).unwrap().unwrap();
        match event.payload {
            EventPayload::HtlcCreated {
                receiver: r,
                token: t,
                amount,
                hashlock,
                timelock,
                ..
            } => {
                assert_eq!(r, receiver);
                assert_eq!(t, token);
                assert_eq!(amount, U256::from(1_000));
                assert_eq!(hashlock, [0xcd; 32]);
                assert_eq!(timelock, 2_000_000);
            }
            other => panic!("wrong payload: {:?}", other),
        }
    }

    #[test]
    fn truncated_data_is_a_decode_error() {
        let log = base_log(
            htlc_addr(),
            vec![*topics::HTLC_CLAIMED, H256::repeat_byte(0x42)],
            vec![0u8; 16],
        );
        let err = decoder().decode_log(&log).unwrap_err();
        assert!(matches!(err, RelayerError::Decode { chain_id: 1, .. }));
    }

    #[test]
    fn foreign_contract_logs_are_skipped() {
        let log = base_log(
            Address::repeat_byte(0xee),
            vec![*topics::HTLC_REFUNDED, H256::repeat_byte(0x42)],
            vec![],
        );
        assert!(decoder().decode_log(&log).unwrap().is_none());
    }

    #[test]
    fn unknown_topics_are_skipped() {
        let log = base_log(htlc_addr(), vec![H256::repeat_byte(0x99)], vec![]);
        assert!(decoder().decode_log(&log).unwrap().is_none());
    }

    #[test]
    fn event_key_identity() {
        let log = base_log(
            htlc_addr(),
            vec![*topics::HTLC_REFUNDED, H256::repeat_byte(0x42)],
            vec![],
        );
        let event = decoder().decode_log(&log).unwrap().unwrap();
        let key = event.key();
        assert_eq!(key.chain_id, 1);
        assert_eq!(key.tx_hash, H256::repeat_byte(0x01));
        assert_eq!(key.log_index, 3);
    }
}
