//! Asset references and transfer identifiers

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Token interface reported by the indexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStandard {
    Erc721,
    Erc1155,
}

impl TokenStandard {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenStandard::Erc721 => "erc721",
            TokenStandard::Erc1155 => "erc1155",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "erc721" => Some(TokenStandard::Erc721),
            "erc1155" => Some(TokenStandard::Erc1155),
            _ => None,
        }
    }
}

/// Identifies a bridgeable asset. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub contract: Address,
    pub token_id: U256,
    pub standard: TokenStandard,
}

impl AssetRef {
    pub fn erc721(contract: Address, token_id: U256) -> Self {
        Self {
            contract,
            token_id,
            standard: TokenStandard::Erc721,
        }
    }

    /// Decimal token id, the form the ledger and indexer use
    pub fn token_id_string(&self) -> String {
        self.token_id.to_string()
    }
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Idempotency key correlating the lock/mint (and later burn/unlock) legs of
/// one transfer across both chains.
///
/// Derived exactly once per attempt and resubmitted identically to every
/// contract call in that attempt. A failed attempt is retried with a brand-new
/// id; ids that have touched a chain are never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId([u8; 32]);

impl TransferId {
    /// Derive an id from the attempt's fixed inputs.
    ///
    /// The hash covers both gateway contracts and a per-process sequence in
    /// addition to initiator, token id, and time, so two attempts can never
    /// collide: not across collections sharing a token id, and not across
    /// retries landing in the same millisecond.
    pub fn derive(
        initiator: Address,
        source_contract: Address,
        dest_contract: Address,
        token_id: U256,
        timestamp_millis: i64,
        sequence: u64,
    ) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(initiator.as_bytes());
        hasher.update(source_contract.as_bytes());
        hasher.update(dest_contract.as_bytes());

        let mut token = [0u8; 32];
        token_id.to_big_endian(&mut token);
        hasher.update(token);

        hasher.update(timestamp_millis.to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    pub fn into_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self)
    }
}

impl FromStr for TransferId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}
