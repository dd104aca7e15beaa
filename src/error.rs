//! Error types for the bridge orchestrator

use crate::orchestrator::TransferId;

use ethers::types::H256;
use std::fmt;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain} is not configured")]
    ChainNotFound { chain: String },

    #[error("Failed to switch wallet to {chain}: {message}")]
    NetworkSwitchFailed { chain: String, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Token {token_id} is owned by {owner}, not the connected wallet")]
    NotOwner { token_id: String, owner: String },

    #[error("Token {token_id} is already locked")]
    AlreadyLocked { token_id: String },

    #[error("Transfer {transfer_id} was already processed on the destination chain")]
    AlreadyProcessed { transfer_id: TransferId },

    #[error("{principal} is not on the allow list for this mint")]
    NotEligible { principal: String },

    #[error("A bridge attempt for token {token_id} is already in flight")]
    TransferInFlight { token_id: String },

    #[error("No active wrapped copy of token {token_id} on {chain}")]
    NoActiveWrap { token_id: String, chain: String },

    #[error("Transfer approval rejected: {0}")]
    ApprovalRejected(String),

    #[error("Chain call failed on {chain} ({category}): {message}")]
    ChainCall {
        chain: String,
        category: ChainErrorCategory,
        message: String,
    },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error(
        "Bridge attempt {transfer_id} failed after the lock; the asset was \
         unlocked and returned (tx {unlock_hash:?})"
    )]
    MintFailedAssetReturned {
        transfer_id: TransferId,
        unlock_hash: H256,
    },

    #[error(
        "Manual intervention required: mint for {transfer_id} failed and the \
         compensating unlock also failed ({detail}); the asset remains locked \
         on the source chain"
    )]
    CompensationFailed {
        transfer_id: TransferId,
        detail: String,
    },

    #[error(
        "Manual intervention required: wrapped copy for {transfer_id} was \
         burned (tx {burn_hash:?}) but the unlock failed ({detail}); the \
         original remains locked"
    )]
    ReversalStranded {
        transfer_id: TransferId,
        burn_hash: H256,
        detail: String,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BridgeError {
    /// Check if a fresh attempt (with a fresh transfer id) is worth trying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::NetworkSwitchFailed { .. }
                | BridgeError::Wallet(_)
                | BridgeError::ApprovalRejected(_)
                | BridgeError::ChainCall { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::MintFailedAssetReturned { .. }
        )
    }

    /// Check if the protocol invariant was broken and an operator must step in
    pub fn needs_manual_intervention(&self) -> bool {
        matches!(
            self,
            BridgeError::CompensationFailed { .. } | BridgeError::ReversalStranded { .. }
        )
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Human-readable categories for raw provider/contract errors.
///
/// Raw provider strings are never surfaced to callers directly; every chain
/// call error is folded into one of these buckets first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorCategory {
    UserRejected,
    InsufficientFunds,
    NonceConflict,
    Reverted,
    Unknown,
}

impl fmt::Display for ChainErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainErrorCategory::UserRejected => "rejected by user",
            ChainErrorCategory::InsufficientFunds => "insufficient funds",
            ChainErrorCategory::NonceConflict => "nonce conflict",
            ChainErrorCategory::Reverted => "contract revert",
            ChainErrorCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Fold a raw provider error string into a [`ChainErrorCategory`]
pub fn categorize_provider_error(message: &str) -> ChainErrorCategory {
    let msg = message.to_lowercase();
    if msg.contains("user denied") || msg.contains("user rejected") {
        ChainErrorCategory::UserRejected
    } else if msg.contains("insufficient funds") {
        ChainErrorCategory::InsufficientFunds
    } else if msg.contains("nonce too low") || msg.contains("replacement transaction underpriced") {
        ChainErrorCategory::NonceConflict
    } else if msg.contains("revert") {
        ChainErrorCategory::Reverted
    } else {
        ChainErrorCategory::Unknown
    }
}
