//! Typed gateways for the asset, lock, and mint contracts
//!
//! Every mutating call is gas-bounded and awaited to its inclusion receipt; a
//! call counts as committed only once a successful receipt is observed, never
//! on mempool acceptance alone.

use crate::config::{GasConfig, OrchestratorConfig};
use crate::error::{categorize_provider_error, BridgeError, BridgeResult, ChainErrorCategory};
use crate::orchestrator::{AssetRef, TransferId};
use crate::session::{ChainSessionManager, ChainSigner};

use async_trait::async_trait;
use ethers::abi::Detokenize;
use ethers::contract::{abigen, ContractCall, ContractError};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, TransactionReceipt, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

abigen!(
    AssetNft,
    r#"[
        function ownerOf(uint256 tokenId) external view returns (address)
        function approve(address to, uint256 tokenId) external
    ]"#
);

abigen!(
    LockGateway,
    r#"[
        function mint(address to, uint256 tokenId) external
        function lockNFT(address assetContract, uint256 tokenId, bytes32 transferId) external
        function unlockNFT(bytes32 transferId) external
        function lockedTokens(uint256 tokenId) external view returns (bool)
        function processedTransfers(bytes32 transferId) external view returns (bool)
    ]"#
);

abigen!(
    MintGateway,
    r#"[
        function mintWrappedNFT(address to, address originalContract, uint256 tokenId, bytes32 transferId, string metadataUri) external
        function burnWrappedNFT(uint256 tokenId, bytes32 transferId) external
        function processedTransfers(bytes32 transferId) external view returns (bool)
    ]"#
);

/// Typed invocation of the asset/bridge operations on the active chain.
///
/// Mutating methods resolve once the transaction's inclusion receipt has been
/// observed at the configured confirmation depth.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractGateway: Send + Sync {
    async fn owner_of(&self, asset: &AssetRef) -> BridgeResult<Address>;

    async fn approve_transfer(&self, asset: &AssetRef, operator: Address) -> BridgeResult<H256>;

    async fn is_locked(&self, asset: &AssetRef) -> BridgeResult<bool>;

    async fn lock(&self, asset: &AssetRef, transfer_id: TransferId) -> BridgeResult<H256>;

    async fn unlock(&self, transfer_id: TransferId) -> BridgeResult<H256>;

    async fn mint_wrapped(
        &self,
        to: Address,
        original_contract: Address,
        token_id: U256,
        transfer_id: TransferId,
        metadata_uri: String,
    ) -> BridgeResult<H256>;

    async fn burn_wrapped(&self, token_id: U256, transfer_id: TransferId) -> BridgeResult<H256>;

    /// Direct mint on the lock gateway (no bridging involved)
    async fn mint_asset(&self, to: Address, token_id: U256) -> BridgeResult<H256>;

    /// Idempotency probe: has a gateway on `chain_key` already consumed this
    /// transfer id? Read-only, does not require switching networks.
    async fn is_processed_on(&self, chain_key: &str, transfer_id: TransferId)
        -> BridgeResult<bool>;
}

/// EVM implementation backed by the chain session's active signer
pub struct EvmGateway {
    session: Arc<ChainSessionManager>,
    gas: GasConfig,
    call_timeout: Duration,
    confirmations: usize,
}

impl EvmGateway {
    pub fn new(session: Arc<ChainSessionManager>, config: &OrchestratorConfig) -> Self {
        Self {
            session,
            gas: config.gas.clone(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            confirmations: config.confirmation_blocks,
        }
    }

    async fn active_chain(&self) -> BridgeResult<String> {
        self.session.active_chain().await.ok_or_else(|| {
            BridgeError::Wallet("no active network; call switch_to first".to_string())
        })
    }

    /// Lock gateway bound to the active chain's signer
    async fn lock_gateway(&self) -> BridgeResult<(String, LockGateway<ChainSigner>)> {
        let chain = self.active_chain().await?;
        let endpoint = self.session.endpoint(&chain)?;
        let address = endpoint.lock_contract.ok_or_else(|| {
            BridgeError::Config(format!("chain {} has no lock gateway configured", chain))
        })?;
        let signer = self.session.current_signer().await?;
        Ok((chain, LockGateway::new(address, signer)))
    }

    /// Mint gateway bound to the active chain's signer
    async fn mint_gateway(&self) -> BridgeResult<(String, MintGateway<ChainSigner>)> {
        let chain = self.active_chain().await?;
        let endpoint = self.session.endpoint(&chain)?;
        let address = endpoint.mint_contract.ok_or_else(|| {
            BridgeError::Config(format!("chain {} has no mint gateway configured", chain))
        })?;
        let signer = self.session.current_signer().await?;
        Ok((chain, MintGateway::new(address, signer)))
    }

    async fn asset_contract(&self, asset: &AssetRef) -> BridgeResult<(String, AssetNft<ChainSigner>)> {
        let chain = self.active_chain().await?;
        let signer = self.session.current_signer().await?;
        Ok((chain, AssetNft::new(asset.contract, signer)))
    }

    /// Submit a mutating call and wait for its inclusion receipt
    async fn commit<D: Detokenize>(
        &self,
        chain: &str,
        operation: &str,
        call: ContractCall<ChainSigner, D>,
        gas_limit: u64,
    ) -> BridgeResult<H256> {
        let call = call.gas(gas_limit);

        let wait = async {
            let pending = call
                .send()
                .await
                .map_err(|e| self.contract_error(chain, e))?;
            let tx_hash = pending.tx_hash();
            debug!(operation, ?tx_hash, "transaction submitted, awaiting receipt");

            let receipt = pending
                .confirmations(self.confirmations)
                .await
                .map_err(|e| {
                    self.session.failover(chain);
                    chain_call_error(chain, e.to_string())
                })?
                .ok_or_else(|| {
                    chain_call_error(
                        chain,
                        format!("{} transaction was dropped from the mempool", operation),
                    )
                })?;

            ensure_success(chain, operation, &receipt)?;
            Ok::<H256, BridgeError>(receipt.transaction_hash)
        };

        match timeout(self.call_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    fn contract_error<M: Middleware>(&self, chain: &str, error: ContractError<M>) -> BridgeError {
        let message = error.to_string();
        let category = categorize_provider_error(&message);
        // Connection-level failures rotate the RPC so the user's next attempt
        // lands on a different provider.
        if category == ChainErrorCategory::Unknown {
            self.session.failover(chain);
        }
        BridgeError::ChainCall {
            chain: chain.to_string(),
            category,
            message,
        }
    }
}

#[async_trait]
impl ContractGateway for EvmGateway {
    async fn owner_of(&self, asset: &AssetRef) -> BridgeResult<Address> {
        let (chain, contract) = self.asset_contract(asset).await?;
        contract
            .owner_of(asset.token_id)
            .call()
            .await
            .map_err(|e| self.contract_error(&chain, e))
    }

    async fn approve_transfer(&self, asset: &AssetRef, operator: Address) -> BridgeResult<H256> {
        let (chain, contract) = self.asset_contract(asset).await?;
        let call = contract.approve(operator, asset.token_id);
        self.commit(&chain, "approve", call, self.gas.approve)
            .await
            .map_err(|e| match e {
                // Approval refusals are user-recoverable, keep them distinct
                BridgeError::ChainCall { category, message, .. }
                    if category == ChainErrorCategory::UserRejected =>
                {
                    BridgeError::ApprovalRejected(message)
                }
                other => other,
            })
    }

    async fn is_locked(&self, asset: &AssetRef) -> BridgeResult<bool> {
        let (chain, gateway) = self.lock_gateway().await?;
        gateway
            .locked_tokens(asset.token_id)
            .call()
            .await
            .map_err(|e| self.contract_error(&chain, e))
    }

    async fn lock(&self, asset: &AssetRef, transfer_id: TransferId) -> BridgeResult<H256> {
        let (chain, gateway) = self.lock_gateway().await?;
        let call = gateway.lock_nft(asset.contract, asset.token_id, transfer_id.into_bytes());
        self.commit(&chain, "lockNFT", call, self.gas.lock).await
    }

    async fn unlock(&self, transfer_id: TransferId) -> BridgeResult<H256> {
        let (chain, gateway) = self.lock_gateway().await?;
        let call = gateway.unlock_nft(transfer_id.into_bytes());
        self.commit(&chain, "unlockNFT", call, self.gas.unlock).await
    }

    async fn mint_wrapped(
        &self,
        to: Address,
        original_contract: Address,
        token_id: U256,
        transfer_id: TransferId,
        metadata_uri: String,
    ) -> BridgeResult<H256> {
        let (chain, gateway) = self.mint_gateway().await?;
        let call = gateway.mint_wrapped_nft(
            to,
            original_contract,
            token_id,
            transfer_id.into_bytes(),
            metadata_uri,
        );
        self.commit(&chain, "mintWrappedNFT", call, self.gas.mint)
            .await
    }

    async fn burn_wrapped(&self, token_id: U256, transfer_id: TransferId) -> BridgeResult<H256> {
        let (chain, gateway) = self.mint_gateway().await?;
        let call = gateway.burn_wrapped_nft(token_id, transfer_id.into_bytes());
        self.commit(&chain, "burnWrappedNFT", call, self.gas.burn)
            .await
    }

    async fn mint_asset(&self, to: Address, token_id: U256) -> BridgeResult<H256> {
        let (chain, gateway) = self.lock_gateway().await?;
        let call = gateway.mint(to, token_id);
        self.commit(&chain, "mint", call, self.gas.mint).await
    }

    async fn is_processed_on(
        &self,
        chain_key: &str,
        transfer_id: TransferId,
    ) -> BridgeResult<bool> {
        let endpoint = self.session.endpoint(chain_key)?;
        let address = endpoint
            .mint_contract
            .or(endpoint.lock_contract)
            .ok_or_else(|| {
                BridgeError::Config(format!("chain {} has no bridge gateway configured", chain_key))
            })?;

        let provider: Arc<Provider<Http>> = Arc::new(self.session.read_provider(chain_key)?);
        MintGateway::new(address, provider)
            .processed_transfers(transfer_id.into_bytes())
            .call()
            .await
            .map_err(|e| chain_call_error(chain_key, e.to_string()))
    }
}

fn chain_call_error(chain: &str, message: String) -> BridgeError {
    BridgeError::ChainCall {
        chain: chain.to_string(),
        category: categorize_provider_error(&message),
        message,
    }
}

/// A receipt commits a call only if the transaction succeeded
fn ensure_success(chain: &str, operation: &str, receipt: &TransactionReceipt) -> BridgeResult<()> {
    if receipt.status == Some(1.into()) {
        Ok(())
    } else {
        Err(BridgeError::ChainCall {
            chain: chain.to_string(),
            category: ChainErrorCategory::Reverted,
            message: format!(
                "{} reverted in block {:?}",
                operation, receipt.block_number
            ),
        })
    }
}
