//! Transfer ledger: the durable record of every bridge attempt
//!
//! The ledger is advisory, not authoritative — on-chain state is the ground
//! truth. Inserts that fail must never block a chain operation, and updates are
//! retried once before being dropped, to keep ledger/chain drift small.

mod store;

pub use store::{LedgerStore, PgLedgerStore};

#[cfg(test)]
pub use store::MockLedgerStore;

use crate::error::BridgeResult;
use crate::orchestrator::{AssetRef, TransferId};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Status of one bridge attempt. Monotonic: a terminal state never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransferStatus::Pending),
            "completed" => Some(TransferStatus::Completed),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }
}

/// Which protocol leg a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Mint,
    LockAndMint,
    BurnAndUnlock,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Mint => "mint",
            TransferKind::LockAndMint => "lock_and_mint",
            TransferKind::BurnAndUnlock => "burn_and_unlock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mint" => Some(TransferKind::Mint),
            "lock_and_mint" => Some(TransferKind::LockAndMint),
            "burn_and_unlock" => Some(TransferKind::BurnAndUnlock),
            _ => None,
        }
    }
}

/// Insert payload for a new attempt; the store assigns id and creation time
#[derive(Debug, Clone)]
pub struct TransferDraft {
    pub transfer_id: TransferId,
    pub kind: TransferKind,
    pub asset: AssetRef,
    pub initiator: Address,
    pub source_chain: String,
    pub target_chain: String,
    pub source_contract: Option<Address>,
    pub target_contract: Option<Address>,
    pub status: TransferStatus,
    pub is_active: bool,
}

/// Durable record of one bridge attempt. Never deleted.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: Uuid,
    pub transfer_id: TransferId,
    pub kind: TransferKind,
    pub asset: AssetRef,
    pub initiator: Address,
    pub source_chain: String,
    pub target_chain: String,
    pub source_contract: Option<Address>,
    pub target_contract: Option<Address>,
    pub lock_hash: Option<H256>,
    pub mint_hash: Option<H256>,
    pub burn_hash: Option<H256>,
    pub unlock_hash: Option<H256>,
    pub status: TransferStatus,
    /// True while the asset is live in its wrapped form on the target chain
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(draft: TransferDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            transfer_id: draft.transfer_id,
            kind: draft.kind,
            asset: draft.asset,
            initiator: draft.initiator,
            source_chain: draft.source_chain,
            target_chain: draft.target_chain,
            source_contract: draft.source_contract,
            target_contract: draft.target_contract,
            lock_hash: None,
            mint_hash: None,
            burn_hash: None,
            unlock_hash: None,
            status: draft.status,
            is_active: draft.is_active,
            created_at: Utc::now(),
        }
    }
}

/// In-place update to a record; unset fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct TransferPatch {
    pub lock_hash: Option<H256>,
    pub mint_hash: Option<H256>,
    pub burn_hash: Option<H256>,
    pub unlock_hash: Option<H256>,
    pub status: Option<TransferStatus>,
    pub is_active: Option<bool>,
}

impl TransferPatch {
    pub fn lock_hash(mut self, hash: H256) -> Self {
        self.lock_hash = Some(hash);
        self
    }

    pub fn mint_hash(mut self, hash: H256) -> Self {
        self.mint_hash = Some(hash);
        self
    }

    pub fn burn_hash(mut self, hash: H256) -> Self {
        self.burn_hash = Some(hash);
        self
    }

    pub fn unlock_hash(mut self, hash: H256) -> Self {
        self.unlock_hash = Some(hash);
        self
    }

    pub fn status(mut self, status: TransferStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_active(mut self, active: bool) -> Self {
        self.is_active = Some(active);
        self
    }

    /// Fold this patch into a record (used by in-memory stores)
    pub fn apply_to(&self, record: &mut TransferRecord) {
        if let Some(hash) = self.lock_hash {
            record.lock_hash = Some(hash);
        }
        if let Some(hash) = self.mint_hash {
            record.mint_hash = Some(hash);
        }
        if let Some(hash) = self.burn_hash {
            record.burn_hash = Some(hash);
        }
        if let Some(hash) = self.unlock_hash {
            record.unlock_hash = Some(hash);
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(active) = self.is_active {
            record.is_active = active;
        }
    }
}

/// Filters for owner-facing transfer listings
#[derive(Debug, Clone, Default)]
pub struct TransferFilter {
    pub status: Option<TransferStatus>,
    pub kind: Option<TransferKind>,
    pub limit: Option<i64>,
}

/// Read-side answer to "is this token currently a wrapped copy here?"
#[derive(Debug, Clone)]
pub struct WrappedInfo {
    pub record_id: Uuid,
    pub transfer_id: TransferId,
    pub original_chain: String,
    pub original_contract: Option<Address>,
}

/// Advisory ledger access used by the orchestrator.
///
/// All write paths degrade to warnings: the chain protocol must proceed even
/// when the record store is unreachable.
#[derive(Clone)]
pub struct LedgerClient {
    store: Arc<dyn LedgerStore>,
    update_retries: u32,
}

impl LedgerClient {
    pub fn new(store: Arc<dyn LedgerStore>, update_retries: u32) -> Self {
        Self {
            store,
            update_retries,
        }
    }

    /// Open the durable marker for a new attempt. A store failure is logged
    /// and the attempt proceeds without a record.
    pub async fn open_pending(&self, draft: TransferDraft) -> Option<TransferRecord> {
        match self.store.insert(draft).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ledger insert failed, proceeding without a record: {}", e);
                crate::metrics::record_ledger_error();
                None
            }
        }
    }

    /// Patch a record opened by this attempt. Status regressions out of a
    /// terminal state are refused at this boundary.
    pub async fn apply(&self, record: Option<&TransferRecord>, mut patch: TransferPatch) {
        let Some(record) = record else { return };

        if let Some(next) = patch.status {
            if record.status.is_terminal() && next != record.status {
                warn!(
                    "Refusing ledger status regression {} -> {} for {}",
                    record.status.as_str(),
                    next.as_str(),
                    record.id
                );
                patch.status = None;
            }
        }

        self.update_with_retry(record.id, patch).await;
    }

    /// Flip a record inactive without touching its status
    pub async fn retire(&self, record_id: Uuid) {
        self.update_with_retry(record_id, TransferPatch::default().is_active(false))
            .await;
    }

    async fn update_with_retry(&self, id: Uuid, patch: TransferPatch) {
        let mut attempts = 0;
        loop {
            match self.store.update(id, patch.clone()).await {
                Ok(()) => return,
                Err(e) if attempts < self.update_retries => {
                    attempts += 1;
                    warn!(
                        "Ledger update for {} failed (attempt {}), retrying: {}",
                        id, attempts, e
                    );
                }
                Err(e) => {
                    warn!(
                        "Dropping ledger update for {} after {} attempts: {}",
                        id,
                        attempts + 1,
                        e
                    );
                    crate::metrics::record_ledger_error();
                    return;
                }
            }
        }
    }

    /// Most recent active wrap of `token_id` targeting `chain`, if any
    pub async fn wrapped_info(
        &self,
        token_id: &str,
        chain: &str,
    ) -> BridgeResult<Option<WrappedInfo>> {
        Ok(self
            .store
            .find_active(token_id, chain)
            .await?
            .map(|record| WrappedInfo {
                record_id: record.id,
                transfer_id: record.transfer_id,
                original_chain: record.source_chain,
                original_contract: record.source_contract,
            }))
    }

    /// Resolve the wrap status of many tokens at once (gallery views)
    pub async fn wrapped_info_batch(
        &self,
        token_ids: &[String],
        chain: &str,
    ) -> HashMap<String, Option<WrappedInfo>> {
        let lookups = token_ids.iter().map(|token_id| async move {
            let info = match self.wrapped_info(token_id, chain).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Wrapped lookup failed for token {}: {}", token_id, e);
                    None
                }
            };
            (token_id.clone(), info)
        });

        futures::future::join_all(lookups).await.into_iter().collect()
    }

    /// Owner-facing history listing
    pub async fn transfers_for(
        &self,
        initiator: Address,
        filter: TransferFilter,
    ) -> BridgeResult<Vec<TransferRecord>> {
        self.store.find_by_initiator(initiator, filter).await
    }
}
