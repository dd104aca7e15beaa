//! Transfer orchestration: the multi-step lock/mint and burn/unlock protocol
//!
//! The orchestrator drives a fixed sequence of chain-switch and contract-call
//! steps across two chains that share no atomicity. Preconditions are verified
//! before anything irreversible, every receipt is awaited before the next step,
//! and the one irreversible step with a later failure mode (lock, then mint)
//! has a designated compensating transition (unlock with the same transfer id).
//! The ledger is written at every phase transition but stays advisory; on-chain
//! state is the ground truth.

pub(crate) mod transfer;

pub use transfer::{AssetRef, TokenStandard, TransferId};

use crate::eligibility::EligibilityCheck;
use crate::error::{BridgeError, BridgeResult};
use crate::gateway::ContractGateway;
use crate::ledger::{
    LedgerClient, TransferDraft, TransferKind, TransferPatch, TransferRecord, TransferStatus,
};
use crate::notify::{Progress, ProgressSink};
use crate::session::ChainSessionManager;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Phases of the forward machine and its mirror. A failure in any phase maps
/// to exactly one recovery: abort cleanly before `Locked`, compensate after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// No attempt underway
    Idle,
    Initiated,
    SourceVerified,
    Locked,
    DestVerified,
    Minted,
    MintFailed,
    Unlocking,
    Unlocked,
    BurnInitiated,
    Burned,
    UnlockInitiated,
}

impl BridgePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgePhase::Idle => "idle",
            BridgePhase::Initiated => "initiated",
            BridgePhase::SourceVerified => "source_verified",
            BridgePhase::Locked => "locked",
            BridgePhase::DestVerified => "dest_verified",
            BridgePhase::Minted => "minted",
            BridgePhase::MintFailed => "mint_failed",
            BridgePhase::Unlocking => "unlocking",
            BridgePhase::Unlocked => "unlocked",
            BridgePhase::BurnInitiated => "burn_initiated",
            BridgePhase::Burned => "burned",
            BridgePhase::UnlockInitiated => "unlock_initiated",
        }
    }
}

/// Outcome of a completed forward bridge
#[derive(Debug, Clone)]
pub struct BridgeReceipt {
    pub transfer_id: TransferId,
    pub lock_hash: H256,
    pub mint_hash: H256,
}

/// Outcome of a completed reverse bridge
#[derive(Debug, Clone)]
pub struct ReturnReceipt {
    pub transfer_id: TransferId,
    pub burn_hash: H256,
    pub unlock_hash: H256,
}

/// Outcome of a direct mint
#[derive(Debug, Clone)]
pub struct MintReceipt {
    pub mint_hash: H256,
}

/// Drives the cross-chain transfer protocol
pub struct TransferOrchestrator {
    session: Arc<ChainSessionManager>,
    gateway: Arc<dyn ContractGateway>,
    eligibility: Arc<dyn EligibilityCheck>,
    ledger: LedgerClient,
    sink: Arc<dyn ProgressSink>,
    /// Client-side guard against concurrent attempts on the same asset
    in_flight: DashMap<String, ()>,
    /// One attempt at a time owns the session: the active network is shared
    /// with everything else in the process
    attempt_lock: Mutex<()>,
    attempt_seq: AtomicU64,
}

/// Releases the in-flight slot for an asset when the attempt ends
#[derive(Debug)]
struct FlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
        crate::metrics::record_in_flight(self.map.len());
    }
}

impl TransferOrchestrator {
    pub fn new(
        session: Arc<ChainSessionManager>,
        gateway: Arc<dyn ContractGateway>,
        eligibility: Arc<dyn EligibilityCheck>,
        ledger: LedgerClient,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            session,
            gateway,
            eligibility,
            ledger,
            sink,
            in_flight: DashMap::new(),
            attempt_lock: Mutex::new(()),
            attempt_seq: AtomicU64::new(0),
        }
    }

    /// Read-side access to the transfer ledger (wrap status, history)
    pub fn ledger(&self) -> &LedgerClient {
        &self.ledger
    }

    /// Lock `asset` on `source_chain` and mint its wrapped copy on `dest_chain`.
    ///
    /// Derives a fresh transfer id for this attempt. Retrying a failed attempt
    /// is simply another call; an id that has touched a chain is never reused.
    pub async fn bridge_forward(
        &self,
        asset: &AssetRef,
        source_chain: &str,
        dest_chain: &str,
        metadata_uri: &str,
    ) -> BridgeResult<BridgeReceipt> {
        let _flight = self.begin_flight(asset)?;
        let _session = self.attempt_lock.lock().await;

        let source = self.session.endpoint(source_chain)?;
        let dest = self.session.endpoint(dest_chain)?;
        let lock_contract = source.lock_contract.ok_or_else(|| {
            BridgeError::Config(format!(
                "chain {} has no lock gateway configured",
                source_chain
            ))
        })?;
        let mint_contract = dest.mint_contract.ok_or_else(|| {
            BridgeError::Config(format!(
                "chain {} has no mint gateway configured",
                dest_chain
            ))
        })?;
        let initiator = self.session.wallet_address();

        let transfer_id = self.next_transfer_id(lock_contract, mint_contract, asset);
        crate::metrics::record_forward_started(source_chain, dest_chain);
        enter_phase(transfer_id, BridgePhase::Initiated);
        info!(
            %transfer_id,
            token_id = %asset.token_id,
            source_chain,
            dest_chain,
            "starting forward bridge"
        );

        // Durable marker that an attempt is underway, before any chain call.
        let record = self
            .ledger
            .open_pending(TransferDraft {
                transfer_id,
                kind: TransferKind::LockAndMint,
                asset: asset.clone(),
                initiator,
                source_chain: source_chain.to_string(),
                target_chain: dest_chain.to_string(),
                source_contract: Some(lock_contract),
                target_contract: Some(mint_contract),
                status: TransferStatus::Pending,
                is_active: true,
            })
            .await;
        self.sink.report(Progress::AttemptOpened { transfer_id });

        let result = self
            .forward_protocol(
                asset,
                source_chain,
                dest_chain,
                lock_contract,
                initiator,
                transfer_id,
                metadata_uri,
                record.as_ref(),
            )
            .await;

        match result {
            Ok(receipt) => {
                crate::metrics::record_forward_completed(source_chain, dest_chain);
                self.sink.report(Progress::Completed { transfer_id });
                Ok(receipt)
            }
            Err(err) => {
                crate::metrics::record_forward_failed(source_chain, dest_chain);
                let asset_returned = matches!(err, BridgeError::MintFailedAssetReturned { .. });
                self.sink.report(Progress::Failed {
                    message: err.to_string(),
                    asset_returned,
                });
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_protocol(
        &self,
        asset: &AssetRef,
        source_chain: &str,
        dest_chain: &str,
        lock_contract: Address,
        initiator: Address,
        transfer_id: TransferId,
        metadata_uri: &str,
        record: Option<&TransferRecord>,
    ) -> BridgeResult<BridgeReceipt> {
        // Fail fast before spending any gas.
        if let Err(err) = self
            .verify_preconditions(asset, source_chain, dest_chain, initiator, transfer_id)
            .await
        {
            self.fail_record(record).await;
            return Err(err);
        }
        enter_phase(transfer_id, BridgePhase::SourceVerified);

        // Approve, then lock. The approval is harmless on its own; the lock is
        // the first irreversible step.
        let lock_hash = match self.approve_and_lock(asset, lock_contract, transfer_id).await {
            Ok(hash) => hash,
            Err(err) => {
                self.fail_record(record).await;
                return Err(err);
            }
        };
        enter_phase(transfer_id, BridgePhase::Locked);
        self.ledger
            .apply(record, TransferPatch::default().lock_hash(lock_hash))
            .await;

        // From here the lock obliges us to either mint or explicitly unlock.
        match self
            .mint_leg(asset, dest_chain, initiator, transfer_id, metadata_uri)
            .await
        {
            Ok(mint_hash) => {
                enter_phase(transfer_id, BridgePhase::Minted);
                self.ledger
                    .apply(
                        record,
                        TransferPatch::default()
                            .mint_hash(mint_hash)
                            .status(TransferStatus::Completed),
                    )
                    .await;
                info!(
                    %transfer_id,
                    "bridge committed: asset locked on {}, wrapped copy live on {}",
                    source_chain, dest_chain
                );
                Ok(BridgeReceipt {
                    transfer_id,
                    lock_hash,
                    mint_hash,
                })
            }
            Err(cause) => {
                enter_phase(transfer_id, BridgePhase::MintFailed);
                self.compensate(source_chain, transfer_id, record, cause)
                    .await
            }
        }
    }

    /// All checks that must hold before any state-mutating call
    async fn verify_preconditions(
        &self,
        asset: &AssetRef,
        source_chain: &str,
        dest_chain: &str,
        initiator: Address,
        transfer_id: TransferId,
    ) -> BridgeResult<()> {
        // Re-verified on every attempt; never cached.
        let eligible = self
            .eligibility
            .verify(source_chain, asset, initiator)
            .await?;
        if !eligible {
            return Err(BridgeError::NotEligible {
                principal: format!("{:?}", initiator),
            });
        }
        self.sink.report(Progress::EligibilityPassed);

        // A fresh id can never have been consumed, but an id reused after a
        // pre-chain failure could have been. Read-only probe, no switch needed.
        if self.gateway.is_processed_on(dest_chain, transfer_id).await? {
            return Err(BridgeError::AlreadyProcessed { transfer_id });
        }

        self.sink.report(Progress::SwitchingNetwork {
            chain: source_chain.to_string(),
        });
        self.session.switch_to(source_chain).await?;

        // Never rely on the contract revert to catch a non-owner.
        let owner = self.gateway.owner_of(asset).await?;
        if owner != initiator {
            return Err(BridgeError::NotOwner {
                token_id: asset.token_id_string(),
                owner: format!("{:?}", owner),
            });
        }

        if self.gateway.is_locked(asset).await? {
            return Err(BridgeError::AlreadyLocked {
                token_id: asset.token_id_string(),
            });
        }

        Ok(())
    }

    /// Approve strictly before lock
    async fn approve_and_lock(
        &self,
        asset: &AssetRef,
        lock_contract: Address,
        transfer_id: TransferId,
    ) -> BridgeResult<H256> {
        self.sink.report(Progress::ApprovingTransfer);
        let approve_hash = self.gateway.approve_transfer(asset, lock_contract).await?;
        self.sink
            .report(Progress::TransferApproved { tx_hash: approve_hash });

        self.sink.report(Progress::LockingAsset);
        let lock_hash = self.gateway.lock(asset, transfer_id).await?;
        self.sink.report(Progress::AssetLocked { tx_hash: lock_hash });
        Ok(lock_hash)
    }

    async fn mint_leg(
        &self,
        asset: &AssetRef,
        dest_chain: &str,
        initiator: Address,
        transfer_id: TransferId,
        metadata_uri: &str,
    ) -> BridgeResult<H256> {
        self.sink.report(Progress::SwitchingNetwork {
            chain: dest_chain.to_string(),
        });
        self.session.switch_to(dest_chain).await?;
        enter_phase(transfer_id, BridgePhase::DestVerified);

        self.sink.report(Progress::MintingWrapped);
        let mint_hash = self
            .gateway
            .mint_wrapped(
                initiator,
                asset.contract,
                asset.token_id,
                transfer_id,
                metadata_uri.to_string(),
            )
            .await?;
        self.sink
            .report(Progress::WrappedMinted { tx_hash: mint_hash });
        Ok(mint_hash)
    }

    /// Compensating action: the asset is locked but no wrapped copy exists.
    /// Unlock with the same transfer id the lock consumed.
    async fn compensate(
        &self,
        source_chain: &str,
        transfer_id: TransferId,
        record: Option<&TransferRecord>,
        cause: BridgeError,
    ) -> BridgeResult<BridgeReceipt> {
        warn!(%transfer_id, %cause, "mint failed after lock, unlocking the asset");
        enter_phase(transfer_id, BridgePhase::Unlocking);
        self.sink.report(Progress::ReturningAsset);
        crate::metrics::record_compensation(source_chain);

        let unlocked = match self.session.switch_to(source_chain).await {
            Ok(()) => self.gateway.unlock(transfer_id).await,
            Err(switch_err) => Err(switch_err),
        };

        match unlocked {
            Ok(unlock_hash) => {
                enter_phase(transfer_id, BridgePhase::Unlocked);
                self.ledger
                    .apply(
                        record,
                        TransferPatch::default()
                            .unlock_hash(unlock_hash)
                            .status(TransferStatus::Failed)
                            .is_active(false),
                    )
                    .await;
                self.sink
                    .report(Progress::AssetReturned { tx_hash: unlock_hash });
                Err(BridgeError::MintFailedAssetReturned {
                    transfer_id,
                    unlock_hash,
                })
            }
            Err(unlock_err) => {
                // Asset locked, no wrapped copy, and the release failed: the
                // ledger and chain state have diverged from the invariant.
                crate::metrics::record_compensation_failure(source_chain);
                self.ledger
                    .apply(
                        record,
                        TransferPatch::default()
                            .status(TransferStatus::Failed)
                            .is_active(false),
                    )
                    .await;
                let err = BridgeError::CompensationFailed {
                    transfer_id,
                    detail: format!("mint failed ({}); unlock failed ({})", cause, unlock_err),
                };
                error!(%transfer_id, "{}", err);
                Err(err)
            }
        }
    }

    /// Burn the wrapped copy of `asset` on `current_chain`, then unlock the
    /// original on its origin chain with the transfer id recorded at wrap time.
    pub async fn bridge_backward(
        &self,
        asset: &AssetRef,
        current_chain: &str,
    ) -> BridgeResult<ReturnReceipt> {
        let _flight = self.begin_flight(asset)?;
        let _session = self.attempt_lock.lock().await;

        let token_id = asset.token_id_string();
        let wrapped = self
            .ledger
            .wrapped_info(&token_id, current_chain)
            .await?
            .ok_or_else(|| BridgeError::NoActiveWrap {
                token_id: token_id.clone(),
                chain: current_chain.to_string(),
            })?;

        let transfer_id = wrapped.transfer_id;
        let origin_chain = wrapped.original_chain.clone();
        // Both endpoints must still be configured before we burn anything.
        self.session.endpoint(&origin_chain)?;
        let current = self.session.endpoint(current_chain)?;
        let initiator = self.session.wallet_address();

        crate::metrics::record_reversal_started(current_chain);
        enter_phase(transfer_id, BridgePhase::BurnInitiated);
        info!(%transfer_id, %token_id, %origin_chain, "starting reverse bridge");

        let record = self
            .ledger
            .open_pending(TransferDraft {
                transfer_id,
                kind: TransferKind::BurnAndUnlock,
                asset: asset.clone(),
                initiator,
                source_chain: current_chain.to_string(),
                target_chain: origin_chain.clone(),
                source_contract: current.mint_contract,
                target_contract: wrapped.original_contract,
                status: TransferStatus::Pending,
                is_active: false,
            })
            .await;
        self.sink.report(Progress::AttemptOpened { transfer_id });

        // Burn leg.
        self.sink.report(Progress::SwitchingNetwork {
            chain: current_chain.to_string(),
        });
        let burn_result = match self.session.switch_to(current_chain).await {
            Ok(()) => {
                self.sink.report(Progress::BurningWrapped);
                self.gateway.burn_wrapped(asset.token_id, transfer_id).await
            }
            Err(switch_err) => Err(switch_err),
        };
        let burn_hash = match burn_result {
            Ok(hash) => hash,
            Err(err) => {
                // Nothing irreversible happened; abort cleanly.
                crate::metrics::record_reversal_failed(current_chain);
                self.fail_record(record.as_ref()).await;
                self.sink.report(Progress::Failed {
                    message: err.to_string(),
                    asset_returned: false,
                });
                return Err(err);
            }
        };
        enter_phase(transfer_id, BridgePhase::Burned);
        self.sink.report(Progress::WrappedBurned { tx_hash: burn_hash });
        self.ledger
            .apply(record.as_ref(), TransferPatch::default().burn_hash(burn_hash))
            .await;
        // The wrap is gone on-chain from this point; retire the originating
        // record so the backward path is never offered again for this asset.
        self.ledger.retire(wrapped.record_id).await;

        // Unlock leg.
        enter_phase(transfer_id, BridgePhase::UnlockInitiated);
        self.sink.report(Progress::SwitchingNetwork {
            chain: origin_chain.clone(),
        });
        let unlock_result = match self.session.switch_to(&origin_chain).await {
            Ok(()) => {
                self.sink.report(Progress::UnlockingOriginal);
                self.gateway.unlock(transfer_id).await
            }
            Err(switch_err) => Err(switch_err),
        };

        match unlock_result {
            Ok(unlock_hash) => {
                self.ledger
                    .apply(
                        record.as_ref(),
                        TransferPatch::default()
                            .unlock_hash(unlock_hash)
                            .status(TransferStatus::Completed),
                    )
                    .await;
                crate::metrics::record_reversal_completed(current_chain);
                self.sink
                    .report(Progress::OriginalUnlocked { tx_hash: unlock_hash });
                self.sink.report(Progress::Completed { transfer_id });
                Ok(ReturnReceipt {
                    transfer_id,
                    burn_hash,
                    unlock_hash,
                })
            }
            Err(cause) => {
                // The burn committed but the unlock did not: the wrapped copy
                // is gone and the original stays locked. There is no
                // compensating re-mint; this needs an operator.
                crate::metrics::record_reversal_stranded(current_chain);
                self.fail_record(record.as_ref()).await;
                let err = BridgeError::ReversalStranded {
                    transfer_id,
                    burn_hash,
                    detail: cause.to_string(),
                };
                error!(%transfer_id, "{}", err);
                self.sink.report(Progress::Failed {
                    message: err.to_string(),
                    asset_returned: false,
                });
                Err(err)
            }
        }
    }

    /// Eligibility-gated direct mint on a chain's lock gateway
    pub async fn mint_original(&self, asset: &AssetRef, chain: &str) -> BridgeResult<MintReceipt> {
        let _flight = self.begin_flight(asset)?;
        let _session = self.attempt_lock.lock().await;

        let endpoint = self.session.endpoint(chain)?;
        let lock_contract = endpoint.lock_contract.ok_or_else(|| {
            BridgeError::Config(format!("chain {} has no lock gateway configured", chain))
        })?;
        let initiator = self.session.wallet_address();
        // Same-chain operation; the id only correlates the ledger record.
        let transfer_id = self.next_transfer_id(lock_contract, lock_contract, asset);

        let record = self
            .ledger
            .open_pending(TransferDraft {
                transfer_id,
                kind: TransferKind::Mint,
                asset: asset.clone(),
                initiator,
                source_chain: chain.to_string(),
                target_chain: chain.to_string(),
                source_contract: Some(lock_contract),
                target_contract: None,
                status: TransferStatus::Pending,
                is_active: false,
            })
            .await;

        let eligible = match self.eligibility.verify(chain, asset, initiator).await {
            Ok(v) => v,
            Err(err) => {
                self.fail_record(record.as_ref()).await;
                return Err(err);
            }
        };
        if !eligible {
            self.fail_record(record.as_ref()).await;
            return Err(BridgeError::NotEligible {
                principal: format!("{:?}", initiator),
            });
        }
        self.sink.report(Progress::EligibilityPassed);

        self.sink.report(Progress::SwitchingNetwork {
            chain: chain.to_string(),
        });
        if let Err(err) = self.session.switch_to(chain).await {
            self.fail_record(record.as_ref()).await;
            return Err(err);
        }

        match self.gateway.mint_asset(initiator, asset.token_id).await {
            Ok(mint_hash) => {
                self.ledger
                    .apply(
                        record.as_ref(),
                        TransferPatch::default()
                            .mint_hash(mint_hash)
                            .status(TransferStatus::Completed),
                    )
                    .await;
                crate::metrics::record_direct_mint(chain);
                info!(token_id = %asset.token_id, chain, "minted directly");
                Ok(MintReceipt { mint_hash })
            }
            Err(err) => {
                self.fail_record(record.as_ref()).await;
                Err(err)
            }
        }
    }

    fn begin_flight(&self, asset: &AssetRef) -> BridgeResult<FlightGuard<'_>> {
        let key = format!("{:?}/{}", asset.contract, asset.token_id);
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::TransferInFlight {
                    token_id: asset.token_id_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        crate::metrics::record_in_flight(self.in_flight.len());
        Ok(FlightGuard {
            map: &self.in_flight,
            key,
        })
    }

    fn next_transfer_id(
        &self,
        source_contract: Address,
        dest_contract: Address,
        asset: &AssetRef,
    ) -> TransferId {
        let sequence = self.attempt_seq.fetch_add(1, Ordering::Relaxed);
        TransferId::derive(
            self.session.wallet_address(),
            source_contract,
            dest_contract,
            asset.token_id,
            Utc::now().timestamp_millis(),
            sequence,
        )
    }

    async fn fail_record(&self, record: Option<&TransferRecord>) {
        self.ledger
            .apply(
                record,
                TransferPatch::default()
                    .status(TransferStatus::Failed)
                    .is_active(false),
            )
            .await;
    }
}

fn enter_phase(transfer_id: TransferId, phase: BridgePhase) {
    debug!(%transfer_id, phase = phase.as_str(), "phase transition");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChainEndpoint, DatabaseConfig, MetricsConfig, NativeCurrency, OrchestratorConfig,
        Settings, WalletConfig,
    };
    use crate::eligibility::MockEligibilityCheck;
    use crate::error::ChainErrorCategory;
    use crate::gateway::MockContractGateway;
    use crate::ledger::{LedgerStore, MockLedgerStore, TransferFilter};
    use crate::session::StaticWalletBackend;

    use async_trait::async_trait;
    use ethers::signers::LocalWallet;
    use ethers::types::U256;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn h(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    fn test_asset() -> AssetRef {
        AssetRef::erc721(addr(0x0c), U256::from(42))
    }

    fn endpoint(chain_id: u64, name: &str) -> ChainEndpoint {
        ChainEndpoint {
            chain_id,
            name: name.to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            explorer_url: "https://example.test".to_string(),
            native_currency: NativeCurrency {
                name: name.to_string(),
                symbol: "ETH".to_string(),
                decimals: 18,
            },
            lock_contract: None,
            mint_contract: None,
            verifier_contract: None,
            enabled: true,
        }
    }

    fn test_settings() -> Settings {
        let mut amoy = endpoint(80002, "Polygon Amoy");
        amoy.lock_contract = Some(addr(0xaa));
        let mut base = endpoint(84532, "Base Sepolia");
        base.mint_contract = Some(addr(0xbb));

        let mut chains = HashMap::new();
        chains.insert("amoy".to_string(), amoy);
        chains.insert("base".to_string(), base);

        Settings {
            orchestrator: OrchestratorConfig {
                call_timeout_secs: 30,
                confirmation_blocks: 1,
                ledger_update_retries: 1,
                gas: Default::default(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 1,
                min_connections: 1,
            },
            metrics: MetricsConfig {
                enabled: false,
                port: 0,
            },
            wallet: WalletConfig {
                keystore_path: None,
                private_key_env: None,
            },
            chains,
        }
    }

    fn test_session() -> Arc<ChainSessionManager> {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        Arc::new(
            ChainSessionManager::with_wallet(
                &test_settings(),
                Arc::new(StaticWalletBackend::new([80002, 84532])),
                wallet,
            )
            .unwrap(),
        )
    }

    /// Progress sink that records everything it sees
    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Progress>>);

    impl ProgressSink for RecordingSink {
        fn report(&self, update: Progress) {
            self.0.lock().unwrap().push(update);
        }
    }

    /// In-memory ledger store used for round-trip tests
    #[derive(Default)]
    struct MemoryLedger {
        records: Mutex<Vec<TransferRecord>>,
    }

    #[async_trait]
    impl LedgerStore for MemoryLedger {
        async fn insert(&self, draft: TransferDraft) -> BridgeResult<TransferRecord> {
            let record = TransferRecord::new(draft);
            self.records.lock().unwrap().push(record.clone());
            Ok(record)
        }

        async fn update(&self, id: uuid::Uuid, patch: TransferPatch) -> BridgeResult<()> {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                patch.apply_to(record);
            }
            Ok(())
        }

        async fn find_active(
            &self,
            token_id: &str,
            target_chain: &str,
        ) -> BridgeResult<Option<TransferRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| {
                    r.kind == TransferKind::LockAndMint
                        && r.is_active
                        && r.asset.token_id_string() == token_id
                        && r.target_chain == target_chain
                })
                .max_by_key(|r| r.created_at)
                .cloned())
        }

        async fn find_by_initiator(
            &self,
            _initiator: Address,
            _filter: TransferFilter,
        ) -> BridgeResult<Vec<TransferRecord>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        orchestrator: TransferOrchestrator,
        sink: Arc<RecordingSink>,
    }

    fn fixture(
        gateway: MockContractGateway,
        eligibility: MockEligibilityCheck,
        store: Arc<dyn LedgerStore>,
    ) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = TransferOrchestrator::new(
            test_session(),
            Arc::new(gateway),
            Arc::new(eligibility),
            LedgerClient::new(store, 1),
            sink.clone(),
        );
        Fixture { orchestrator, sink }
    }

    fn eligible() -> MockEligibilityCheck {
        let mut eligibility = MockEligibilityCheck::new();
        eligibility.expect_verify().returning(|_, _, _| Ok(true));
        eligibility
    }

    /// Gateway preloaded with passing precondition checks for `test_asset`
    fn gateway_with_clean_preconditions(owner: Address) -> MockContractGateway {
        let mut gateway = MockContractGateway::new();
        gateway
            .expect_is_processed_on()
            .returning(|_, _| Ok(false));
        gateway.expect_owner_of().returning(move |_| Ok(owner));
        gateway.expect_is_locked().returning(|_| Ok(false));
        gateway
    }

    #[tokio::test]
    async fn forward_happy_path_approves_before_locking() {
        let session = test_session();
        let me = session.wallet_address();

        let mut gateway = gateway_with_clean_preconditions(me);
        let mut seq = mockall::Sequence::new();
        gateway
            .expect_approve_transfer()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, operator| *operator == Address::from([0xaa; 20]))
            .returning(|_, _| Ok(h(1)));
        gateway
            .expect_lock()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(h(2)));
        gateway
            .expect_mint_wrapped()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |to, original, token, _, uri| {
                *to == me && *original == addr(0x0c) && *token == U256::from(42) && uri == "ipfs://x"
            })
            .returning(|_, _, _, _, _| Ok(h(3)));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());

        let receipt = fx
            .orchestrator
            .bridge_forward(&test_asset(), "amoy", "base", "ipfs://x")
            .await
            .unwrap();
        assert_eq!(receipt.lock_hash, h(2));
        assert_eq!(receipt.mint_hash, h(3));

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TransferStatus::Completed);
        assert!(records[0].is_active);
        assert_eq!(records[0].lock_hash, Some(h(2)));
        assert_eq!(records[0].mint_hash, Some(h(3)));
    }

    #[tokio::test]
    async fn ineligible_principal_triggers_no_chain_calls() {
        let mut eligibility = MockEligibilityCheck::new();
        eligibility.expect_verify().returning(|_, _, _| Ok(false));

        // Any gateway call would panic: no expectations are set.
        let gateway = MockContractGateway::new();
        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligibility, store.clone());

        let err = fx
            .orchestrator
            .bridge_forward(&test_asset(), "amoy", "base", "ipfs://x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotEligible { .. }));

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TransferStatus::Failed);
        assert!(!records[0].is_active);
    }

    #[tokio::test]
    async fn non_owner_aborts_before_any_mutation() {
        let mut gateway = MockContractGateway::new();
        gateway.expect_is_processed_on().returning(|_, _| Ok(false));
        gateway.expect_owner_of().returning(|_| Ok(addr(0xde)));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());

        let err = fx
            .orchestrator
            .bridge_forward(&test_asset(), "amoy", "base", "ipfs://x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotOwner { .. }));
        assert_eq!(
            store.records.lock().unwrap()[0].status,
            TransferStatus::Failed
        );
    }

    #[tokio::test]
    async fn locked_token_aborts_before_any_mutation() {
        let session = test_session();
        let me = session.wallet_address();

        let mut gateway = MockContractGateway::new();
        gateway.expect_is_processed_on().returning(|_, _| Ok(false));
        gateway.expect_owner_of().returning(move |_| Ok(me));
        gateway.expect_is_locked().returning(|_| Ok(true));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());

        let err = fx
            .orchestrator
            .bridge_forward(&test_asset(), "amoy", "base", "ipfs://x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyLocked { .. }));
    }

    #[tokio::test]
    async fn mint_failure_unlocks_with_the_same_transfer_id() {
        let session = test_session();
        let me = session.wallet_address();

        let locked_id: Arc<Mutex<Option<TransferId>>> = Arc::new(Mutex::new(None));
        let mut gateway = gateway_with_clean_preconditions(me);
        gateway.expect_approve_transfer().returning(|_, _| Ok(h(1)));

        let capture = locked_id.clone();
        gateway.expect_lock().times(1).returning(move |_, tid| {
            *capture.lock().unwrap() = Some(tid);
            Ok(h(2))
        });
        gateway.expect_mint_wrapped().times(1).returning(|_, _, _, _, _| {
            Err(BridgeError::ChainCall {
                chain: "base".into(),
                category: ChainErrorCategory::Reverted,
                message: "execution reverted: AlreadyProcessed".into(),
            })
        });

        let check = locked_id.clone();
        gateway
            .expect_unlock()
            .times(1)
            .withf(move |tid| Some(*tid) == *check.lock().unwrap())
            .returning(|_| Ok(h(9)));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());

        let err = fx
            .orchestrator
            .bridge_forward(&test_asset(), "amoy", "base", "ipfs://x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MintFailedAssetReturned { .. }));
        assert!(err.is_retryable());

        let records = store.records.lock().unwrap();
        assert_eq!(records[0].status, TransferStatus::Failed);
        assert!(!records[0].is_active);
        assert_eq!(records[0].lock_hash, Some(h(2)));
        assert_eq!(records[0].unlock_hash, Some(h(9)));

        // The user-visible failure states the asset was returned.
        let events = fx.sink.0.lock().unwrap();
        assert!(events
            .iter()
            .any(|p| matches!(p, Progress::AssetReturned { .. })));
        assert!(events
            .iter()
            .any(|p| matches!(p, Progress::Failed { asset_returned: true, .. })));

        // The compensation switched the session back to the source chain.
        assert_eq!(
            fx.orchestrator.session.active_chain().await.as_deref(),
            Some("amoy")
        );
    }

    #[tokio::test]
    async fn failed_compensation_is_a_distinct_severe_error() {
        let session = test_session();
        let me = session.wallet_address();

        let mut gateway = gateway_with_clean_preconditions(me);
        gateway.expect_approve_transfer().returning(|_, _| Ok(h(1)));
        gateway.expect_lock().returning(|_, _| Ok(h(2)));
        gateway.expect_mint_wrapped().returning(|_, _, _, _, _| {
            Err(BridgeError::Timeout {
                operation: "mintWrappedNFT".into(),
            })
        });
        gateway.expect_unlock().returning(|_| {
            Err(BridgeError::ChainCall {
                chain: "amoy".into(),
                category: ChainErrorCategory::Unknown,
                message: "connection reset".into(),
            })
        });

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());

        let err = fx
            .orchestrator
            .bridge_forward(&test_asset(), "amoy", "base", "ipfs://x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::CompensationFailed { .. }));
        assert!(err.needs_manual_intervention());

        let records = store.records.lock().unwrap();
        assert_eq!(records[0].status, TransferStatus::Failed);
        assert!(records[0].unlock_hash.is_none());
    }

    #[tokio::test]
    async fn retry_after_failure_uses_a_fresh_transfer_id() {
        let session = test_session();
        let me = session.wallet_address();

        let seen_ids: Arc<Mutex<Vec<TransferId>>> = Arc::new(Mutex::new(Vec::new()));
        let mut gateway = gateway_with_clean_preconditions(me);
        gateway.expect_approve_transfer().returning(|_, _| Ok(h(1)));

        let capture = seen_ids.clone();
        gateway.expect_lock().times(2).returning(move |_, tid| {
            capture.lock().unwrap().push(tid);
            Ok(h(2))
        });
        // First mint reverts, second succeeds.
        gateway.expect_mint_wrapped().times(1).returning(|_, _, _, _, _| {
            Err(BridgeError::ChainCall {
                chain: "base".into(),
                category: ChainErrorCategory::Reverted,
                message: "execution reverted: AlreadyProcessed".into(),
            })
        });
        gateway
            .expect_mint_wrapped()
            .times(1)
            .returning(|_, _, _, _, _| Ok(h(3)));
        gateway.expect_unlock().times(1).returning(|_| Ok(h(9)));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());
        let asset = test_asset();

        let first = fx
            .orchestrator
            .bridge_forward(&asset, "amoy", "base", "ipfs://x")
            .await;
        assert!(first.is_err());

        let second = fx
            .orchestrator
            .bridge_forward(&asset, "amoy", "base", "ipfs://x")
            .await
            .unwrap();

        let ids = seen_ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1], "a failed attempt must never reuse its id");
        assert_eq!(second.transfer_id, ids[1]);

        // Exactly one live wrap across both attempts.
        let records = store.records.lock().unwrap();
        let active: Vec<_> = records.iter().filter(|r| r.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn round_trip_returns_the_original() {
        let session = test_session();
        let me = session.wallet_address();

        let locked_id: Arc<Mutex<Option<TransferId>>> = Arc::new(Mutex::new(None));
        let mut gateway = gateway_with_clean_preconditions(me);
        gateway.expect_approve_transfer().returning(|_, _| Ok(h(1)));

        let capture = locked_id.clone();
        gateway.expect_lock().times(1).returning(move |_, tid| {
            *capture.lock().unwrap() = Some(tid);
            Ok(h(2))
        });
        gateway
            .expect_mint_wrapped()
            .times(1)
            .returning(|_, _, _, _, _| Ok(h(3)));

        // Return path: burn strictly before unlock, both with the lock's id.
        let mut seq = mockall::Sequence::new();
        let check_burn = locked_id.clone();
        gateway
            .expect_burn_wrapped()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |token, tid| {
                *token == U256::from(42) && Some(*tid) == *check_burn.lock().unwrap()
            })
            .returning(|_, _| Ok(h(4)));
        let check_unlock = locked_id.clone();
        gateway
            .expect_unlock()
            .times(1)
            .in_sequence(&mut seq)
            .withf(move |tid| Some(*tid) == *check_unlock.lock().unwrap())
            .returning(|_| Ok(h(5)));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());
        let asset = test_asset();

        let forward = fx
            .orchestrator
            .bridge_forward(&asset, "amoy", "base", "ipfs://x")
            .await
            .unwrap();

        {
            let records = store.records.lock().unwrap();
            assert_eq!(records.len(), 1);
            assert!(records[0].is_active);
        }

        let back = fx.orchestrator.bridge_backward(&asset, "base").await.unwrap();
        assert_eq!(back.transfer_id, forward.transfer_id);
        assert_eq!(back.burn_hash, h(4));
        assert_eq!(back.unlock_hash, h(5));

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        let original = records
            .iter()
            .find(|r| r.kind == TransferKind::LockAndMint)
            .unwrap();
        assert!(!original.is_active, "the wrap must be retired");
        let reversal = records
            .iter()
            .find(|r| r.kind == TransferKind::BurnAndUnlock)
            .unwrap();
        assert_eq!(reversal.status, TransferStatus::Completed);
        assert_eq!(reversal.burn_hash, Some(h(4)));
        assert_eq!(reversal.unlock_hash, Some(h(5)));
        assert!(records.iter().all(|r| !r.is_active));
    }

    #[tokio::test]
    async fn backward_without_an_active_wrap_fails_gracefully() {
        let mut store = MockLedgerStore::new();
        store.expect_find_active().times(1).returning(|_, _| Ok(None));

        // No insert/update/gateway expectations: any would panic.
        let gateway = MockContractGateway::new();
        let fx = fixture(gateway, MockEligibilityCheck::new(), Arc::new(store));

        let err = fx
            .orchestrator
            .bridge_backward(&test_asset(), "base")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoActiveWrap { .. }));
    }

    #[tokio::test]
    async fn stranded_reversal_is_severe_and_not_retried() {
        let session = test_session();
        let me = session.wallet_address();

        let mut gateway = gateway_with_clean_preconditions(me);
        gateway.expect_approve_transfer().returning(|_, _| Ok(h(1)));
        gateway.expect_lock().returning(|_, _| Ok(h(2)));
        gateway
            .expect_mint_wrapped()
            .returning(|_, _, _, _, _| Ok(h(3)));
        gateway.expect_burn_wrapped().returning(|_, _| Ok(h(4)));
        gateway.expect_unlock().times(1).returning(|_| {
            Err(BridgeError::Timeout {
                operation: "unlockNFT".into(),
            })
        });

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());
        let asset = test_asset();

        fx.orchestrator
            .bridge_forward(&asset, "amoy", "base", "ipfs://x")
            .await
            .unwrap();

        let err = fx
            .orchestrator
            .bridge_backward(&asset, "base")
            .await
            .unwrap_err();
        match &err {
            BridgeError::ReversalStranded { burn_hash, .. } => assert_eq!(*burn_hash, h(4)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.needs_manual_intervention());

        let records = store.records.lock().unwrap();
        let original = records
            .iter()
            .find(|r| r.kind == TransferKind::LockAndMint)
            .unwrap();
        assert!(
            !original.is_active,
            "the wrap was burned; the backward path must not be offered again"
        );
        let reversal = records
            .iter()
            .find(|r| r.kind == TransferKind::BurnAndUnlock)
            .unwrap();
        assert_eq!(reversal.status, TransferStatus::Failed);
        assert_eq!(reversal.burn_hash, Some(h(4)));
        assert!(reversal.unlock_hash.is_none());
    }

    #[tokio::test]
    async fn concurrent_attempt_for_the_same_asset_is_rejected() {
        let fx = fixture(
            MockContractGateway::new(),
            MockEligibilityCheck::new(),
            Arc::new(MemoryLedger::default()),
        );
        let asset = test_asset();

        let guard = fx.orchestrator.begin_flight(&asset).unwrap();
        let err = fx.orchestrator.begin_flight(&asset).unwrap_err();
        assert!(matches!(err, BridgeError::TransferInFlight { .. }));

        // A bridge call while the first attempt is outstanding is rejected
        // before any ledger or chain interaction.
        let err = fx
            .orchestrator
            .bridge_forward(&asset, "amoy", "base", "ipfs://x")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransferInFlight { .. }));

        drop(guard);
        assert!(fx.orchestrator.begin_flight(&asset).is_ok());
    }

    #[tokio::test]
    async fn direct_mint_is_gated_and_recorded() {
        let mut gateway = MockContractGateway::new();
        gateway
            .expect_mint_asset()
            .times(1)
            .returning(|_, _| Ok(h(7)));

        let store = Arc::new(MemoryLedger::default());
        let fx = fixture(gateway, eligible(), store.clone());

        let receipt = fx
            .orchestrator
            .mint_original(&test_asset(), "amoy")
            .await
            .unwrap();
        assert_eq!(receipt.mint_hash, h(7));

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, TransferKind::Mint);
        assert_eq!(records[0].status, TransferStatus::Completed);
        assert!(!records[0].is_active);
    }
}
