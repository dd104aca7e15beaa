//! PostgreSQL-backed ledger store

use super::{TransferDraft, TransferFilter, TransferKind, TransferPatch, TransferRecord, TransferStatus};
use crate::config::DatabaseConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::orchestrator::{AssetRef, TokenStandard, TransferId};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Append-only record store with update-by-id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert(&self, draft: TransferDraft) -> BridgeResult<TransferRecord>;

    async fn update(&self, id: Uuid, patch: TransferPatch) -> BridgeResult<()>;

    /// Most recent active lock-and-mint record for `(token_id, target_chain)`
    async fn find_active(
        &self,
        token_id: &str,
        target_chain: &str,
    ) -> BridgeResult<Option<TransferRecord>>;

    async fn find_by_initiator(
        &self,
        initiator: Address,
        filter: TransferFilter,
    ) -> BridgeResult<Vec<TransferRecord>>;
}

/// Ledger store persisting to PostgreSQL
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub async fn new(config: &DatabaseConfig) -> BridgeResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(BridgeError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> BridgeResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bridge_transfers (
                id UUID PRIMARY KEY,
                transfer_id BYTEA NOT NULL,
                kind VARCHAR(20) NOT NULL,
                token_id TEXT NOT NULL,
                asset_contract VARCHAR(42) NOT NULL,
                token_standard VARCHAR(10) NOT NULL,
                initiator VARCHAR(42) NOT NULL,
                source_chain VARCHAR(40) NOT NULL,
                target_chain VARCHAR(40) NOT NULL,
                source_contract VARCHAR(42),
                target_contract VARCHAR(42),
                lock_hash VARCHAR(66),
                mint_hash VARCHAR(66),
                burn_hash VARCHAR(66),
                unlock_hash VARCHAR(66),
                status VARCHAR(20) NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_active_wrap
            ON bridge_transfers (token_id, target_chain)
            WHERE is_active
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transfers_initiator
            ON bridge_transfers (initiator, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Ledger migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> BridgeResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(BridgeError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert(&self, draft: TransferDraft) -> BridgeResult<TransferRecord> {
        let record = TransferRecord::new(draft);

        sqlx::query(
            r#"
            INSERT INTO bridge_transfers
                (id, transfer_id, kind, token_id, asset_contract, token_standard,
                 initiator, source_chain, target_chain, source_contract,
                 target_contract, status, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(&record.transfer_id.as_bytes()[..])
        .bind(record.kind.as_str())
        .bind(record.asset.token_id_string())
        .bind(addr_string(record.asset.contract))
        .bind(record.asset.standard.as_str())
        .bind(addr_string(record.initiator))
        .bind(&record.source_chain)
        .bind(&record.target_chain)
        .bind(record.source_contract.map(addr_string))
        .bind(record.target_contract.map(addr_string))
        .bind(record.status.as_str())
        .bind(record.is_active)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Opened ledger record {} ({})", record.id, record.transfer_id);
        Ok(record)
    }

    async fn update(&self, id: Uuid, patch: TransferPatch) -> BridgeResult<()> {
        sqlx::query(
            r#"
            UPDATE bridge_transfers SET
                lock_hash = COALESCE($2, lock_hash),
                mint_hash = COALESCE($3, mint_hash),
                burn_hash = COALESCE($4, burn_hash),
                unlock_hash = COALESCE($5, unlock_hash),
                status = COALESCE($6, status),
                is_active = COALESCE($7, is_active),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.lock_hash.map(hash_string))
        .bind(patch.mint_hash.map(hash_string))
        .bind(patch.burn_hash.map(hash_string))
        .bind(patch.unlock_hash.map(hash_string))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_active(
        &self,
        token_id: &str,
        target_chain: &str,
    ) -> BridgeResult<Option<TransferRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM bridge_transfers
            WHERE token_id = $1
              AND target_chain = $2
              AND kind = 'lock_and_mint'
              AND is_active
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(token_id)
        .bind(target_chain)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    async fn find_by_initiator(
        &self,
        initiator: Address,
        filter: TransferFilter,
    ) -> BridgeResult<Vec<TransferRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bridge_transfers
            WHERE initiator = $1
              AND ($2::VARCHAR IS NULL OR status = $2)
              AND ($3::VARCHAR IS NULL OR kind = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(addr_string(initiator))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }
}

fn addr_string(address: Address) -> String {
    format!("{:#x}", address)
}

fn hash_string(hash: H256) -> String {
    format!("{:?}", hash)
}

fn parse_addr(s: &str) -> BridgeResult<Address> {
    s.parse()
        .map_err(|_| BridgeError::Ledger(format!("malformed address in ledger row: {}", s)))
}

fn parse_opt_addr(s: Option<String>) -> BridgeResult<Option<Address>> {
    s.as_deref().map(parse_addr).transpose()
}

fn parse_opt_hash(s: Option<String>) -> BridgeResult<Option<H256>> {
    s.as_deref()
        .map(|h| {
            h.parse()
                .map_err(|_| BridgeError::Ledger(format!("malformed tx hash in ledger row: {}", h)))
        })
        .transpose()
}

fn row_to_record(row: sqlx::postgres::PgRow) -> BridgeResult<TransferRecord> {
    let transfer_id_bytes: Vec<u8> = row.get("transfer_id");
    let transfer_id = TransferId::from_slice(&transfer_id_bytes)
        .ok_or_else(|| BridgeError::Ledger("malformed transfer id in ledger row".to_string()))?;

    let kind_str: String = row.get("kind");
    let kind = TransferKind::parse(&kind_str)
        .ok_or_else(|| BridgeError::Ledger(format!("unknown transfer kind: {}", kind_str)))?;

    let status_str: String = row.get("status");
    let status = TransferStatus::parse(&status_str)
        .ok_or_else(|| BridgeError::Ledger(format!("unknown transfer status: {}", status_str)))?;

    let standard_str: String = row.get("token_standard");
    let standard = TokenStandard::parse(&standard_str)
        .ok_or_else(|| BridgeError::Ledger(format!("unknown token standard: {}", standard_str)))?;

    let token_id_str: String = row.get("token_id");
    let token_id = U256::from_dec_str(&token_id_str)
        .map_err(|_| BridgeError::Ledger(format!("malformed token id: {}", token_id_str)))?;

    let asset_contract: String = row.get("asset_contract");
    let initiator: String = row.get("initiator");

    Ok(TransferRecord {
        id: row.get("id"),
        transfer_id,
        kind,
        asset: AssetRef {
            contract: parse_addr(&asset_contract)?,
            token_id,
            standard,
        },
        initiator: parse_addr(&initiator)?,
        source_chain: row.get("source_chain"),
        target_chain: row.get("target_chain"),
        source_contract: parse_opt_addr(row.get("source_contract"))?,
        target_contract: parse_opt_addr(row.get("target_contract"))?,
        lock_hash: parse_opt_hash(row.get("lock_hash"))?,
        mint_hash: parse_opt_hash(row.get("mint_hash"))?,
        burn_hash: parse_opt_hash(row.get("burn_hash"))?,
        unlock_hash: parse_opt_hash(row.get("unlock_hash"))?,
        status,
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}
