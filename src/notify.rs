//! Progress reporting for in-flight bridge attempts
//!
//! The orchestrator reports every phase transition through a [`ProgressSink`];
//! hosts surface these to the user however they like (toasts, status bars).

use crate::orchestrator::TransferId;

use ethers::types::H256;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{error, info};

/// One user-visible step of a bridge attempt
#[derive(Debug, Clone)]
pub enum Progress {
    AttemptOpened { transfer_id: TransferId },
    EligibilityPassed,
    ApprovingTransfer,
    TransferApproved { tx_hash: H256 },
    LockingAsset,
    AssetLocked { tx_hash: H256 },
    SwitchingNetwork { chain: String },
    MintingWrapped,
    WrappedMinted { tx_hash: H256 },
    BurningWrapped,
    WrappedBurned { tx_hash: H256 },
    UnlockingOriginal,
    OriginalUnlocked { tx_hash: H256 },
    /// Compensation: the mint failed and the locked asset is being released
    ReturningAsset,
    AssetReturned { tx_hash: H256 },
    Completed { transfer_id: TransferId },
    Failed {
        message: String,
        /// True when the asset was unlocked and returned to its owner
        asset_returned: bool,
    },
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::AttemptOpened { transfer_id } => {
                write!(f, "Bridge attempt {} opened", transfer_id)
            }
            Progress::EligibilityPassed => write!(f, "Allow-list check passed"),
            Progress::ApprovingTransfer => write!(f, "Approving NFT transfer..."),
            Progress::TransferApproved { tx_hash } => {
                write!(f, "Transfer approved ({:?})", tx_hash)
            }
            Progress::LockingAsset => write!(f, "Locking NFT on source chain..."),
            Progress::AssetLocked { tx_hash } => write!(f, "NFT locked ({:?})", tx_hash),
            Progress::SwitchingNetwork { chain } => write!(f, "Switching to {}...", chain),
            Progress::MintingWrapped => write!(f, "Minting wrapped NFT..."),
            Progress::WrappedMinted { tx_hash } => {
                write!(f, "Wrapped NFT minted ({:?})", tx_hash)
            }
            Progress::BurningWrapped => write!(f, "Burning wrapped NFT..."),
            Progress::WrappedBurned { tx_hash } => {
                write!(f, "Wrapped NFT burned ({:?})", tx_hash)
            }
            Progress::UnlockingOriginal => write!(f, "Unlocking original NFT..."),
            Progress::OriginalUnlocked { tx_hash } => {
                write!(f, "Original NFT unlocked ({:?})", tx_hash)
            }
            Progress::ReturningAsset => {
                write!(f, "Mint failed, returning the locked NFT...")
            }
            Progress::AssetReturned { tx_hash } => {
                write!(f, "NFT unlocked and returned ({:?})", tx_hash)
            }
            Progress::Completed { transfer_id } => {
                write!(f, "Bridge attempt {} completed", transfer_id)
            }
            Progress::Failed {
                message,
                asset_returned,
            } => {
                if *asset_returned {
                    write!(f, "Bridge failed, funds returned: {}", message)
                } else {
                    write!(f, "Bridge failed: {}", message)
                }
            }
        }
    }
}

/// Receives progress updates from the orchestrator
#[cfg_attr(test, mockall::automock)]
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: Progress);
}

/// Sink that writes progress to the tracing log
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn report(&self, update: Progress) {
        match &update {
            Progress::Failed { .. } => error!("{}", update),
            _ => info!("{}", update),
        }
    }
}

/// Sink that fans progress out to broadcast subscribers (UI listeners)
pub struct BroadcastSink {
    tx: broadcast::Sender<Progress>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn report(&self, update: Progress) {
        // No receivers is fine
        let _ = self.tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_sink_delivers_in_order() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();

        sink.report(Progress::ApprovingTransfer);
        sink.report(Progress::LockingAsset);

        assert!(matches!(rx.recv().await, Ok(Progress::ApprovingTransfer)));
        assert!(matches!(rx.recv().await, Ok(Progress::LockingAsset)));
    }

    #[test]
    fn failure_message_mentions_returned_funds() {
        let failed = Progress::Failed {
            message: "mint reverted".into(),
            asset_returned: true,
        };
        assert!(failed.to_string().contains("funds returned"));
    }
}
