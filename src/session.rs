//! Chain session management
//!
//! Holds exactly one active network connection and one signing identity. Every
//! contract call targets whatever network is currently active, so callers must
//! `switch_to` the right chain immediately before calling out. All switches are
//! funneled through a single lock because the active network is process-wide
//! state shared with the wallet.

use crate::config::{ChainEndpoint, Settings, WalletConfig};
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Signer bound to the currently active network
pub type ChainSigner = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Why the wallet declined a network request
#[derive(Debug, Error)]
pub enum SwitchRejection {
    /// The wallet does not know the requested network and needs it registered
    #[error("unrecognized chain")]
    UnrecognizedChain,
    #[error("{0}")]
    Rejected(String),
}

/// The wallet side of network management.
///
/// Mirrors the switch/add pair every injected wallet exposes: a switch request
/// can fail with [`SwitchRejection::UnrecognizedChain`], after which the chain
/// must be registered and the switch retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletBackend: Send + Sync {
    async fn switch_network(&self, chain_id: u64) -> Result<(), SwitchRejection>;
    async fn add_network(&self, endpoint: &ChainEndpoint) -> Result<(), SwitchRejection>;
}

/// In-process wallet backend that tracks which networks it has been told about
pub struct StaticWalletBackend {
    known: RwLock<std::collections::HashSet<u64>>,
}

impl StaticWalletBackend {
    pub fn new(initial: impl IntoIterator<Item = u64>) -> Self {
        Self {
            known: RwLock::new(initial.into_iter().collect()),
        }
    }
}

#[async_trait]
impl WalletBackend for StaticWalletBackend {
    async fn switch_network(&self, chain_id: u64) -> Result<(), SwitchRejection> {
        if self.known.read().await.contains(&chain_id) {
            Ok(())
        } else {
            Err(SwitchRejection::UnrecognizedChain)
        }
    }

    async fn add_network(&self, endpoint: &ChainEndpoint) -> Result<(), SwitchRejection> {
        self.known.write().await.insert(endpoint.chain_id);
        Ok(())
    }
}

/// HTTP providers for one endpoint, with index-rotation failover
struct EndpointProviders {
    http: Vec<Provider<Http>>,
    current: AtomicUsize,
}

impl EndpointProviders {
    fn new(endpoint: &ChainEndpoint) -> BridgeResult<Self> {
        let mut http = Vec::new();

        for url in &endpoint.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http.push(provider);
                    debug!("Added HTTP provider for {}: {}", endpoint.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http.is_empty() {
            return Err(BridgeError::Config(format!(
                "chain {} has no usable RPC providers",
                endpoint.name
            )));
        }

        Ok(Self {
            http,
            current: AtomicUsize::new(0),
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        &self.http[idx % self.http.len()]
    }

    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.http.len();
        self.current.store(next, Ordering::Relaxed);
    }
}

/// Owns the single active network connection and the signing identity
pub struct ChainSessionManager {
    endpoints: HashMap<String, ChainEndpoint>,
    providers: DashMap<String, Arc<EndpointProviders>>,
    wallet: LocalWallet,
    backend: Arc<dyn WalletBackend>,
    active: RwLock<Option<String>>,
    /// All network switches are serialized through this lock
    switch_lock: Mutex<()>,
}

impl ChainSessionManager {
    /// Create a session manager, loading the wallet from the configured source
    pub fn new(settings: &Settings, backend: Arc<dyn WalletBackend>) -> BridgeResult<Self> {
        let wallet = load_wallet(&settings.wallet)?;
        Self::with_wallet(settings, backend, wallet)
    }

    /// Create a session manager around an already-loaded wallet
    pub fn with_wallet(
        settings: &Settings,
        backend: Arc<dyn WalletBackend>,
        wallet: LocalWallet,
    ) -> BridgeResult<Self> {
        let providers = DashMap::new();
        let mut endpoints = HashMap::new();

        for (key, endpoint) in settings.enabled_chains() {
            providers.insert(key.clone(), Arc::new(EndpointProviders::new(endpoint)?));
            endpoints.insert(key.clone(), endpoint.clone());
            info!(
                "Registered chain {} (ID: {})",
                endpoint.name, endpoint.chain_id
            );
        }

        info!("Session wallet: {:?}", wallet.address());

        Ok(Self {
            endpoints,
            providers,
            wallet,
            backend,
            active: RwLock::new(None),
            switch_lock: Mutex::new(()),
        })
    }

    /// Address of the signing identity
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// Look up a configured endpoint by chain key
    pub fn endpoint(&self, chain_key: &str) -> BridgeResult<&ChainEndpoint> {
        self.endpoints
            .get(chain_key)
            .ok_or_else(|| BridgeError::ChainNotFound {
                chain: chain_key.to_string(),
            })
    }

    /// Key of the currently active chain, if any
    pub async fn active_chain(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Make `chain_key` the active network.
    ///
    /// If the wallet does not recognize the chain, it is registered and the
    /// switch retried exactly once. Any other rejection aborts the step.
    pub async fn switch_to(&self, chain_key: &str) -> BridgeResult<()> {
        let endpoint = self.endpoint(chain_key)?.clone();
        let _guard = self.switch_lock.lock().await;

        if self.active.read().await.as_deref() == Some(chain_key) {
            debug!("Chain {} is already active", chain_key);
            return Ok(());
        }

        match self.backend.switch_network(endpoint.chain_id).await {
            Ok(()) => {}
            Err(SwitchRejection::UnrecognizedChain) => {
                info!(
                    "Wallet does not know chain {}, registering it",
                    endpoint.name
                );
                self.backend
                    .add_network(&endpoint)
                    .await
                    .map_err(|r| switch_failed(chain_key, r))?;
                self.backend
                    .switch_network(endpoint.chain_id)
                    .await
                    .map_err(|r| switch_failed(chain_key, r))?;
            }
            Err(rejection) => return Err(switch_failed(chain_key, rejection)),
        }

        *self.active.write().await = Some(chain_key.to_string());
        crate::metrics::record_network_switch(chain_key);
        debug!("Active network is now {}", endpoint.name);
        Ok(())
    }

    /// Signer bound to the active network.
    ///
    /// Only valid until the next `switch_to`; callers must not hold a signer
    /// across a network switch.
    pub async fn current_signer(&self) -> BridgeResult<Arc<ChainSigner>> {
        let active = self.active.read().await.clone().ok_or_else(|| {
            BridgeError::Wallet("no active network; call switch_to first".to_string())
        })?;

        let endpoint = self.endpoint(&active)?;
        let providers = self
            .providers
            .get(&active)
            .ok_or_else(|| BridgeError::ChainNotFound {
                chain: active.clone(),
            })?;

        let wallet = self.wallet.clone().with_chain_id(endpoint.chain_id);
        Ok(Arc::new(SignerMiddleware::new(
            providers.http().clone(),
            wallet,
        )))
    }

    /// Read-only provider for view calls on any configured chain.
    ///
    /// Does not touch the active network; safe to use without switching.
    pub fn read_provider(&self, chain_key: &str) -> BridgeResult<Provider<Http>> {
        let providers = self
            .providers
            .get(chain_key)
            .ok_or_else(|| BridgeError::ChainNotFound {
                chain: chain_key.to_string(),
            })?;
        Ok(providers.http().clone())
    }

    /// Rotate to the next RPC provider for a chain after a connection failure
    pub fn failover(&self, chain_key: &str) {
        if let Some(providers) = self.providers.get(chain_key) {
            providers.failover();
            warn!("Chain {} failed over to the next RPC provider", chain_key);
        }
    }
}

fn switch_failed(chain_key: &str, rejection: SwitchRejection) -> BridgeError {
    BridgeError::NetworkSwitchFailed {
        chain: chain_key.to_string(),
        message: rejection.to_string(),
    }
}

/// Load the signing wallet from the environment variable named in the config
fn load_wallet(config: &WalletConfig) -> BridgeResult<LocalWallet> {
    if let Some(ref var) = config.private_key_env {
        if let Ok(key) = env::var(var) {
            return key
                .parse::<LocalWallet>()
                .map_err(|e| BridgeError::Wallet(format!("Invalid private key in {}: {}", var, e)));
        }
    }

    // In production we'd also support an encrypted keystore with password prompt
    Err(BridgeError::Wallet(
        "No wallet configured. Set the private key env var named in [wallet]".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DatabaseConfig, MetricsConfig, NativeCurrency, OrchestratorConfig, WalletConfig,
    };
    use mockall::Sequence;
    use tokio_test::assert_ok;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_endpoint(chain_id: u64, name: &str) -> ChainEndpoint {
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
        let mut chains = HashMap::new();
        chains.insert("amoy".to_string(), test_endpoint(80002, "Polygon Amoy"));
        chains.insert("base".to_string(), test_endpoint(84532, "Base Sepolia"));
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

    fn session_with(backend: Arc<dyn WalletBackend>) -> ChainSessionManager {
        let wallet: LocalWallet = TEST_KEY.parse().unwrap();
        ChainSessionManager::with_wallet(&test_settings(), backend, wallet).unwrap()
    }

    #[tokio::test]
    async fn switch_to_known_chain() {
        let session = session_with(Arc::new(StaticWalletBackend::new([80002, 84532])));

        tokio_test::assert_ok!(session.switch_to("amoy").await);
        assert_eq!(session.active_chain().await.as_deref(), Some("amoy"));

        tokio_test::assert_ok!(session.switch_to("base").await);
        assert_eq!(session.active_chain().await.as_deref(), Some("base"));
    }

    #[tokio::test]
    async fn unknown_chain_is_registered_and_retried_once() {
        let mut backend = MockWalletBackend::new();
        let mut seq = Sequence::new();

        backend
            .expect_switch_network()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(SwitchRejection::UnrecognizedChain));
        backend
            .expect_add_network()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|e| e.chain_id == 80002)
            .returning(|_| Ok(()));
        backend
            .expect_switch_network()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let session = session_with(Arc::new(backend));
        tokio_test::assert_ok!(session.switch_to("amoy").await);
        assert_eq!(session.active_chain().await.as_deref(), Some("amoy"));
    }

    #[tokio::test]
    async fn other_rejections_propagate() {
        let mut backend = MockWalletBackend::new();
        backend
            .expect_switch_network()
            .times(1)
            .returning(|_| Err(SwitchRejection::Rejected("user declined".to_string())));

        let session = session_with(Arc::new(backend));
        let err = session.switch_to("amoy").await.unwrap_err();
        assert!(matches!(err, BridgeError::NetworkSwitchFailed { .. }));
        assert_eq!(session.active_chain().await, None);
    }

    #[tokio::test]
    async fn signer_requires_an_active_network() {
        let session = session_with(Arc::new(StaticWalletBackend::new([80002, 84532])));
        assert!(session.current_signer().await.is_err());

        session.switch_to("amoy").await.unwrap();
        let signer = session.current_signer().await.unwrap();
        assert_eq!(signer.signer().chain_id(), 80002);
    }

    #[tokio::test]
    async fn unconfigured_chain_is_an_error() {
        let session = session_with(Arc::new(StaticWalletBackend::new([80002])));
        let err = session.switch_to("cardona").await.unwrap_err();
        assert!(matches!(err, BridgeError::ChainNotFound { .. }));
    }
}
