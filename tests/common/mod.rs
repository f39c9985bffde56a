#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use coldwallet::blockchain_data::{BlockchainDataProvider, FeeBands, ProviderError, ProviderTxStatus, ProviderUtxo};
use coldwallet::config::{Config, Network};
use coldwallet::hooks::{TransactionMetadata, WalletHooks};
use coldwallet::keys::{script_pubkey_for, KeyMaterial};
use coldwallet::retry::RetryPolicy;
use coldwallet::store::OfflineStore;
use coldwallet::{ScriptType, SignedTransaction, Utxo, WalletEngine};
use tempfile::TempDir;

pub const TIP_HEIGHT: u32 = 2_500_000;

// ============================================================
// MOCK PROVIDER
// ============================================================

/// In-memory provider with switchable failure and recorded broadcasts
pub struct MockProvider {
    network: Network,
    utxos: Mutex<HashMap<String, Vec<ProviderUtxo>>>,
    statuses: Mutex<HashMap<String, ProviderTxStatus>>,
    fee_range: Mutex<Vec<f64>>,
    pub broadcasts: Mutex<Vec<String>>,
    pub utxo_calls: AtomicUsize,
    pub down: AtomicBool,
    /// Calls still to be answered with a 503 before recovering
    pub flaky: AtomicUsize,
}

impl MockProvider {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            utxos: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            fee_range: Mutex::new(vec![1.0, 3.0, 4.0, 8.0, 12.0, 25.0, 80.0]),
            broadcasts: Mutex::new(Vec::new()),
            utxo_calls: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            flaky: AtomicUsize::new(0),
        }
    }

    pub fn set_utxos(&self, address: &str, utxos: Vec<ProviderUtxo>) {
        self.utxos.lock().unwrap().insert(address.to_string(), utxos);
    }

    pub fn set_status(&self, txid: &str, status: ProviderTxStatus) {
        self.statuses.lock().unwrap().insert(txid.to_string(), status);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: usize) {
        self.flaky.store(calls, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<(), ProviderError> {
        let flaky = self.flaky.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if flaky || self.down.load(Ordering::SeqCst) {
            Err(ProviderError::Server { status: 503, body: "maintenance".into() })
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl BlockchainDataProvider for MockProvider {
    fn network(&self) -> Network {
        self.network
    }

    async fn get_address_utxos(&self, address: &str) -> Result<Vec<ProviderUtxo>, ProviderError> {
        self.utxo_calls.fetch_add(1, Ordering::SeqCst);
        self.check_up()?;
        Ok(self.utxos.lock().unwrap().get(address).cloned().unwrap_or_default())
    }

    async fn get_tip_height(&self) -> Result<u32, ProviderError> {
        self.check_up()?;
        Ok(TIP_HEIGHT)
    }

    async fn get_fee_bands(&self) -> Result<FeeBands, ProviderError> {
        self.check_up()?;
        let range = self.fee_range.lock().unwrap().clone();
        FeeBands::from_fee_range(&range).ok_or_else(|| ProviderError::ParseError("bad range".into()))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ProviderError> {
        self.check_up()?;
        self.broadcasts.lock().unwrap().push(raw_tx_hex.to_string());
        let tx = coldwallet::BuilderBackend::Library
            .builder()
            .decode(&hex::decode(raw_tx_hex).map_err(|e| ProviderError::Rejected { status: 400, reason: e.to_string() })?)
            .map_err(|e| ProviderError::Rejected { status: 400, reason: e.to_string() })?;
        coldwallet::BuilderBackend::Library
            .builder()
            .txid(&tx)
            .map_err(|e| ProviderError::Rejected { status: 400, reason: e.to_string() })
    }

    async fn get_tx_status(&self, txid: &str) -> Result<Option<ProviderTxStatus>, ProviderError> {
        self.check_up()?;
        Ok(self.statuses.lock().unwrap().get(txid).copied())
    }

    fn explorer_url(&self, txid: &str) -> Option<String> {
        Some(format!("https://explorer.invalid/tx/{}", txid))
    }
}

// ============================================================
// RECORDING HOOKS
// ============================================================

#[derive(Default)]
pub struct RecordingHooks {
    pub finalized: Mutex<Vec<TransactionMetadata>>,
    pub extra: Mutex<HashMap<String, Vec<Utxo>>>,
}

#[async_trait::async_trait]
impl WalletHooks for RecordingHooks {
    async fn on_transaction_finalized(
        &self,
        _signed: &SignedTransaction,
        metadata: &TransactionMetadata,
    ) -> coldwallet::Result<()> {
        self.finalized.lock().unwrap().push(metadata.clone());
        Ok(())
    }

    async fn known_utxos(&self, address: &str) -> coldwallet::Result<Vec<Utxo>> {
        Ok(self.extra.lock().unwrap().get(address).cloned().unwrap_or_default())
    }
}

// ============================================================
// FIXTURES
// ============================================================

/// Deterministic key from a repeated byte
pub fn test_key(byte: u8, network: Network) -> KeyMaterial {
    KeyMaterial::from_hex(&format!("{:02x}", byte).repeat(32), network).unwrap()
}

pub fn utxo_for(key: &KeyMaterial, script_type: ScriptType, tag: u8, vout: u32, value: u64) -> Utxo {
    Utxo {
        txid: format!("{:02x}", tag).repeat(32),
        vout,
        value,
        script_pubkey: script_pubkey_for(key, script_type).to_bytes(),
        confirmations: 6,
    }
}

pub fn provider_utxo(tag: u8, vout: u32, value: u64) -> ProviderUtxo {
    ProviderUtxo {
        txid: format!("{:02x}", tag).repeat(32),
        vout,
        value,
        block_height: Some(TIP_HEIGHT - 5),
    }
}

pub fn test_config(dir: &TempDir, network: Network) -> Config {
    Config {
        network,
        data_dir: dir.path().to_path_buf(),
        timeout_secs: 2,
        retry: RetryPolicy { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 4, backoff_multiplier: 2.0 },
        ..Config::default()
    }
}

/// Engine over a file-backed store in a fresh temp dir
pub fn engine_with(provider: Arc<MockProvider>, config: Config) -> WalletEngine {
    let store = OfflineStore::open(config.cache_db_path()).unwrap();
    WalletEngine::new(config, provider, store)
}
