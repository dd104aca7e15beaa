//! Allow-list membership checks gating the mint path
//!
//! A pass/fail oracle: the caller proves membership with a Merkle proof served
//! by an external distribution endpoint and verified on-chain. Results are
//! never cached across attempts, since allow lists can change between them.

use crate::error::{BridgeError, BridgeResult};
use crate::orchestrator::{transfer::keccak256, AssetRef};
use crate::session::ChainSessionManager;

use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::providers::{Http, Provider};
use ethers::types::Address;
use ethers::utils::to_checksum;
use std::sync::Arc;
use tracing::debug;

abigen!(
    MerkleVerifier,
    r#"[
        function verifyProof(bytes32[] proof, bytes32 leaf) external view returns (bool)
    ]"#
);

/// A previously-distributed proof path plus its root
#[derive(Debug, Clone)]
pub struct MembershipProof {
    pub proof: Vec<[u8; 32]>,
    pub root: [u8; 32],
}

/// External proof-distribution endpoint, interface only
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProofSource: Send + Sync {
    async fn fetch(&self, token_id: &str, principal: Address) -> BridgeResult<MembershipProof>;
}

/// The oracle the orchestrator consults before any mint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EligibilityCheck: Send + Sync {
    /// Is `principal` allowed to mint/bridge this asset? Called strictly
    /// before any minting call; must be re-evaluated on every attempt.
    async fn verify(
        &self,
        chain_key: &str,
        asset: &AssetRef,
        principal: Address,
    ) -> BridgeResult<bool>;
}

/// Leaf hash for the allow-list tree: keccak256("{tokenId}-{address}")
pub fn leaf_for(token_id: &str, principal: Address) -> [u8; 32] {
    let preimage = format!("{}-{}", token_id, to_checksum(&principal, None));
    keccak256(preimage.as_bytes())
}

/// Verifies membership against the on-chain verifier contract
pub struct OnChainEligibility {
    session: Arc<ChainSessionManager>,
    source: Arc<dyn ProofSource>,
}

impl OnChainEligibility {
    pub fn new(session: Arc<ChainSessionManager>, source: Arc<dyn ProofSource>) -> Self {
        Self { session, source }
    }
}

#[async_trait]
impl EligibilityCheck for OnChainEligibility {
    async fn verify(
        &self,
        chain_key: &str,
        asset: &AssetRef,
        principal: Address,
    ) -> BridgeResult<bool> {
        let endpoint = self.session.endpoint(chain_key)?;
        let verifier = endpoint.verifier_contract.ok_or_else(|| {
            BridgeError::Config(format!(
                "chain {} has no allow-list verifier configured",
                chain_key
            ))
        })?;

        let token_id = asset.token_id_string();
        let membership = self.source.fetch(&token_id, principal).await?;
        let leaf = leaf_for(&token_id, principal);

        // View call through a read-only provider: no network switch required.
        let provider: Arc<Provider<Http>> = Arc::new(self.session.read_provider(chain_key)?);
        let valid = MerkleVerifier::new(verifier, provider)
            .verify_proof(membership.proof, leaf)
            .call()
            .await
            .map_err(|e| BridgeError::ChainCall {
                chain: chain_key.to_string(),
                category: crate::error::categorize_provider_error(&e.to_string()),
                message: e.to_string(),
            })?;

        debug!(
            %token_id,
            principal = ?principal,
            valid,
            "allow-list proof verified on-chain"
        );
        Ok(valid)
    }
}
