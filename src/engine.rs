//! Engine facade
//!
//! Coordinates the fee estimator, UTXO cache, builder, signer, validator and
//! broadcast gateway. Provides the high-level operations the CLI (or any
//! host wallet) calls.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

use crate::blockchain_data::{BlockchainDataProvider, MempoolSpaceApi};
use crate::broadcast::{BroadcastGateway, TrackOptions};
use crate::builder::{self, BuildRequest, BuilderBackend, InputSource};
use crate::cache::UtxoCache;
use crate::config::{Config, Network};
use crate::error::{Result, WalletError};
use crate::fee::FeeEstimator;
use crate::hooks::{NoopHooks, TransactionMetadata, WalletHooks};
use crate::keys::{address_to_script, KeyMaterial};
use crate::signer;
use crate::store::OfflineStore;
use crate::types::{CacheEntry, FeeEstimate, Freshness, Priority, SignedTransaction, TxOutput, TxStatus, Utxo};
use crate::validator::{self, ValidationContext, ValidationReport};

/// How the fee rate of a send is chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeeChoice {
    Priority(Priority),
    /// Explicit sat/vB; skips estimation
    Rate(f64),
}

impl Default for FeeChoice {
    fn default() -> Self {
        FeeChoice::Priority(Priority::Medium)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    /// Addresses whose UTXOs are candidates
    pub from_addresses: Vec<String>,
    /// Spend exactly these instead of selecting from `from_addresses`
    pub explicit_inputs: Option<Vec<Utxo>>,
    pub outputs: Vec<TxOutput>,
    pub fee: FeeChoice,
    pub change_address: Option<String>,
    /// Serve candidates from the offline store only
    pub force_offline: bool,
    /// Defaults to the configured backend
    pub backend: Option<BuilderBackend>,
}

/// A signed, validated transaction that has not been broadcast
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub signed: SignedTransaction,
    pub raw_hex: String,
    pub txid: String,
    pub fee_rate: f64,
    /// Set when the rate came from the estimator
    pub fee_estimate: Option<FeeEstimate>,
    pub change_index: Option<usize>,
    pub report: ValidationReport,
    /// Freshness of each source address' UTXO set
    pub freshness: Vec<(String, Freshness)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub txid: String,
    pub status: TxStatus,
    pub explorer_url: Option<String>,
}

pub struct WalletEngine {
    config: Config,
    store: OfflineStore,
    fees: FeeEstimator,
    cache: Arc<UtxoCache>,
    gateway: BroadcastGateway,
    hooks: Arc<dyn WalletHooks>,
}

impl WalletEngine {
    /// Wire the components around an already opened store and provider
    pub fn new(config: Config, provider: Arc<dyn BlockchainDataProvider>, store: OfflineStore) -> Self {
        let timeout = config.timeout();
        let fees = FeeEstimator::new(
            provider.clone(),
            store.clone(),
            config.fee_policy.clone(),
            config.retry.clone(),
            timeout,
        );
        let cache = Arc::new(UtxoCache::new(
            store.clone(),
            provider.clone(),
            config.retry.clone(),
            timeout,
            Duration::from_secs(config.cache_ttl_secs),
        ));
        let gateway = BroadcastGateway::new(provider, config.retry.clone(), timeout).with_cache(cache.clone());

        Self {
            config,
            store,
            fees,
            cache,
            gateway,
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Open the store under the configured data directory and connect to the
    /// configured Esplora provider
    pub fn open(config: Config) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;

        let db_path = config.cache_db_path();
        let store = OfflineStore::open(&db_path)
            .with_context(|| format!("Failed to open cache at {}", db_path.display()))?;

        let mut api = MempoolSpaceApi::new(config.network).with_timeout(config.timeout_secs);
        if let Some(url) = &config.provider_url {
            api = api.with_base_url(url.clone());
        }

        info!("🚀 Engine ready on {} (cache {})", config.network, db_path.display());
        Ok(Self::new(config, Arc::new(api), store))
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn WalletHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    pub fn cache(&self) -> &UtxoCache {
        &self.cache
    }

    pub fn fees(&self) -> &FeeEstimator {
        &self.fees
    }

    pub fn gateway(&self) -> &BroadcastGateway {
        &self.gateway
    }

    /// Toggle offline mode for every component sharing the store
    pub fn set_offline(&self, offline: bool) {
        self.store.set_offline(offline);
    }

    /// Build, sign and validate without broadcasting
    pub async fn prepare(&self, request: &SendRequest, keys: &[KeyMaterial]) -> Result<PreparedTransaction> {
        let network = self.network();
        let backend = request.backend.unwrap_or(self.config.builder);

        let (fee_rate, fee_estimate) = match request.fee {
            FeeChoice::Rate(rate) => (rate, None),
            FeeChoice::Priority(priority) => {
                let estimate = self.fees.estimate(priority, network).await;
                (estimate.rate_sat_per_vbyte, Some(estimate))
            }
        };

        let (inputs, freshness) = match &request.explicit_inputs {
            Some(utxos) => (InputSource::Explicit(utxos.clone()), Vec::new()),
            None => {
                let (candidates, freshness) = self.gather_candidates(request).await?;
                (InputSource::Candidates(candidates), freshness)
            }
        };

        let mut build_request = BuildRequest::new(inputs, request.outputs.clone(), fee_rate)
            .with_dust_threshold(self.config.dust_threshold);
        if let Some(address) = &request.change_address {
            build_request = build_request.with_change_script(address_to_script(address, network)?);
        }

        let built = builder::build(backend, &build_request)?;
        let signed = signer::sign_with_keys(&built.unsigned, keys)?;

        let raw = builder::cross_check(&signed.tx)?;
        let raw_hex = hex::encode(raw);
        let report = validator::validate(&raw_hex, &ValidationContext::new(signed.prevouts.clone(), backend))?;
        if !report.is_valid {
            let detail: Vec<String> = report.issues.iter().map(|i| i.message.clone()).collect();
            return Err(WalletError::Signing(format!("signed transaction failed validation: {}", detail.join("; "))));
        }

        let metadata = TransactionMetadata {
            txid: report.txid.clone(),
            raw_hex: raw_hex.clone(),
            fee: report.fee,
            fee_rate_sat_per_vbyte: report.fee_rate_sat_per_vbyte,
            vsize: report.vsize,
            change_index: built.change_index,
            backend,
            source_addresses: request.from_addresses.clone(),
        };
        self.hooks.on_transaction_finalized(&signed, &metadata).await?;

        info!(
            "✅ Prepared {}: fee {} sats at {:.2} sat/vB ({} vB)",
            report.txid, report.fee, report.fee_rate_sat_per_vbyte, report.vsize
        );

        Ok(PreparedTransaction {
            txid: report.txid.clone(),
            signed,
            raw_hex,
            fee_rate,
            fee_estimate,
            change_index: built.change_index,
            report,
            freshness,
        })
    }

    /// [`prepare`](Self::prepare) and broadcast
    pub async fn send(&self, request: &SendRequest, keys: &[KeyMaterial]) -> Result<PreparedTransaction> {
        let prepared = self.prepare(request, keys).await?;
        let accepted = self.gateway.broadcast(&prepared.raw_hex).await?;
        if accepted != prepared.txid {
            warn!("⚠️  Provider reported txid {} for {}", accepted, prepared.txid);
        }
        Ok(prepared)
    }

    /// Broadcast a transaction prepared elsewhere (e.g. on an offline machine)
    pub async fn broadcast(&self, raw_tx_hex: &str) -> Result<String> {
        self.gateway.broadcast(raw_tx_hex).await
    }

    pub async fn utxos(&self, address: &str, force_offline: bool) -> Result<(CacheEntry, Freshness)> {
        self.cache.get_utxos(address, force_offline).await
    }

    pub async fn balance(&self, address: &str, force_offline: bool) -> Result<(u64, Freshness)> {
        self.cache.balance(address, force_offline).await
    }

    /// Live or fallback estimates for every priority on the configured network
    pub async fn fee_table(&self) -> Vec<FeeEstimate> {
        self.fees.fee_table(self.network()).await
    }

    pub async fn status(&self, txid: &str) -> Result<StatusReport> {
        let status = self.gateway.status(txid).await?;
        Ok(StatusReport {
            txid: txid.to_string(),
            status,
            explorer_url: self.gateway.explorer_url(txid),
        })
    }

    /// Poll until confirmed, then refresh the given addresses
    pub async fn track(&self, txid: &str, addresses: &[String], options: TrackOptions) -> Result<TxStatus> {
        self.gateway.track(txid, addresses, options).await
    }

    pub fn validate(&self, raw_tx_hex: &str, prevouts: Vec<Utxo>) -> Result<ValidationReport> {
        validator::validate(raw_tx_hex, &ValidationContext::new(prevouts, self.config.builder))
    }

    pub fn evict_expired(&self) -> Result<usize> {
        self.cache.evict_expired()
    }

    /// Cached UTXOs of every source address plus hook UTXOs, deduplicated
    async fn gather_candidates(&self, request: &SendRequest) -> Result<(Vec<Utxo>, Vec<(String, Freshness)>)> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut freshness = Vec::with_capacity(request.from_addresses.len());

        for address in &request.from_addresses {
            let (entry, fresh) = self.cache.get_utxos(address, request.force_offline).await?;
            freshness.push((address.clone(), fresh));
            let extra = self.hooks.known_utxos(address).await?;
            for utxo in entry.utxo_set.into_iter().chain(extra) {
                if seen.insert(utxo.outpoint()) {
                    candidates.push(utxo);
                }
            }
        }
        Ok((candidates, freshness))
    }
}
