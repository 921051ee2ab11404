//! Error types for the HTLC relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Submission retries exhausted on chain {chain_id} after {attempts} attempts: {message}")]
    SubmitExhausted {
        chain_id: u64,
        attempts: u32,
        message: String,
    },

    #[error("Invariant breach on order {order_hash}: {message}")]
    InvariantBreach {
        order_hash: String,
        message: String,
    },

    #[error("Decode error on chain {chain_id} at block {block_number}: {message}")]
    Decode {
        chain_id: u64,
        block_number: u64,
        message: String,
    },

    #[error("Pending order table full ({pending} orders, no terminal candidates to evict)")]
    Capacity { pending: usize },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Order {order_hash} not found")]
    OrderNotFound { order_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid secret for order {order_hash}")]
    InvalidSecret { order_hash: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable (transient per the submission policy)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::RateLimited { .. }
        )
    }

    /// Check if error should trigger an operator alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Decode { .. }
                | RelayerError::InvariantBreach { .. }
                | RelayerError::SubmitExhausted { .. }
                | RelayerError::Wallet(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let err = RelayerError::ChainConnection {
            chain_id: 1,
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());

        let err = RelayerError::Timeout {
            operation: "query_events".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn exhausted_submission_is_not_retryable_but_alerts() {
        let err = RelayerError::SubmitExhausted {
            chain_id: 2,
            attempts: 3,
            message: "nonce too low".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.should_alert());
    }

    #[test]
    fn decode_errors_alert() {
        let err = RelayerError::Decode {
            chain_id: 1,
            block_number: 42,
            message: "truncated log data".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.should_alert());
    }
}
