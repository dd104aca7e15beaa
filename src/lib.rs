//! Client-orchestrated NFT bridging between EVM chains
//!
//! Moves a non-fungible token's representation between two independent chains
//! by locking the original on its source chain and minting a wrapped copy on a
//! destination chain, and reverses that operation later (burn wrapped, unlock
//! original). The two chains share no atomicity: the orchestrator preserves
//! "exactly one live representation per asset" with strict step ordering,
//! precondition checks before anything irreversible, and a compensating unlock
//! when a later step fails.
//!
//! This is a library component: UI event handlers or a host service construct a
//! [`orchestrator::TransferOrchestrator`] and call `bridge_forward` /
//! `bridge_backward` on it.

pub mod config;
pub mod eligibility;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod session;

pub use config::Settings;
pub use error::{BridgeError, BridgeResult};
pub use gateway::{ContractGateway, EvmGateway};
pub use ledger::{LedgerClient, PgLedgerStore, TransferRecord, TransferStatus, WrappedInfo};
pub use notify::{BroadcastSink, Progress, ProgressSink, TracingSink};
pub use orchestrator::{AssetRef, BridgeReceipt, ReturnReceipt, TokenStandard, TransferId, TransferOrchestrator};
pub use session::{ChainSessionManager, StaticWalletBackend, WalletBackend};

/// Initialize tracing for hosts that have no subscriber of their own
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nftbridge=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
