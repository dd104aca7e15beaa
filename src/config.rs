//! Configuration management for the bridge orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::{Address, H256};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub database: DatabaseConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on any single wallet/receipt wait
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Confirmations to wait before a receipt counts as committed
    #[serde(default = "default_confirmations")]
    pub confirmation_blocks: usize,
    /// Failed ledger updates are retried this many times before being dropped
    #[serde(default = "default_ledger_retries")]
    pub ledger_update_retries: u32,
    #[serde(default)]
    pub gas: GasConfig,
}

/// Fixed gas bounds per contract operation
#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    #[serde(default = "default_gas_approve")]
    pub approve: u64,
    #[serde(default = "default_gas_lock")]
    pub lock: u64,
    #[serde(default = "default_gas_mint")]
    pub mint: u64,
    #[serde(default = "default_gas_burn")]
    pub burn: u64,
    #[serde(default = "default_gas_unlock")]
    pub unlock: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            approve: default_gas_approve(),
            lock: default_gas_lock(),
            mint: default_gas_mint(),
            burn: default_gas_burn(),
            unlock: default_gas_unlock(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub keystore_path: Option<String>,
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// One side of a bridge: static per-chain configuration, loaded at startup
#[derive(Debug, Clone, Deserialize)]
pub struct ChainEndpoint {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub explorer_url: String,
    pub native_currency: NativeCurrency,
    /// Lock gateway custodying originals on this chain
    #[serde(default)]
    pub lock_contract: Option<Address>,
    /// Mint gateway issuing wrapped copies on this chain
    #[serde(default)]
    pub mint_contract: Option<Address>,
    /// Allow-list verifier consulted before minting
    #[serde(default)]
    pub verifier_contract: Option<Address>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChainEndpoint {
    /// Explorer deep-link for a transaction hash
    pub fn explorer_tx_url(&self, hash: H256) -> String {
        format!("{}/tx/{:?}", self.explorer_url.trim_end_matches('/'), hash)
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("NFTBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.lock_contract.is_none() && chain.mint_contract.is_none() {
                    tracing::warn!(
                        "Chain {} has neither a lock nor a mint gateway - it cannot bridge",
                        name
                    );
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainEndpoint)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain endpoint by its configuration key
    pub fn endpoint(&self, key: &str) -> Option<&ChainEndpoint> {
        self.chains.get(key).filter(|c| c.enabled)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

fn default_call_timeout() -> u64 {
    180
}

fn default_confirmations() -> usize {
    1
}

fn default_ledger_retries() -> u32 {
    1
}

fn default_gas_approve() -> u64 {
    300_000
}

fn default_gas_lock() -> u64 {
    500_000
}

fn default_gas_mint() -> u64 {
    500_000
}

fn default_gas_burn() -> u64 {
    300_000
}

fn default_gas_unlock() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}
