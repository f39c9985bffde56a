//! UTXO cache over the offline store
//!
//! Live reads go to the provider and overwrite the stored entry in a single
//! commit. Forced-offline reads, and live reads the provider cannot answer
//! within the retry budget, serve the stored entry unchanged and annotate it
//! [`Freshness::Stale`]. Local store failures are returned as errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::blockchain_data::{BlockchainDataProvider, ProviderError};
use crate::config::Network;
use crate::error::{Result, WalletError};
use crate::keys::address_to_script;
use crate::retry::RetryPolicy;
use crate::store::OfflineStore;
use crate::types::{sum_values, unix_now, CacheEntry, Freshness, Utxo, MAX_MONEY};

pub struct UtxoCache {
    store: OfflineStore,
    provider: Arc<dyn BlockchainDataProvider>,
    network: Network,
    retry: RetryPolicy,
    /// Bound on a whole live fetch, retries included
    timeout: Duration,
    ttl: Duration,
    // One lock per address so concurrent refreshes of the same key queue up.
    // An entry lives only while some refresh of that address holds it.
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UtxoCache {
    pub fn new(
        store: OfflineStore,
        provider: Arc<dyn BlockchainDataProvider>,
        retry: RetryPolicy,
        timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            network: provider.network(),
            store,
            provider,
            retry,
            timeout,
            ttl,
            fetch_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    /// UTXO set of `address`, live when possible
    pub async fn get_utxos(&self, address: &str, force_offline: bool) -> Result<(CacheEntry, Freshness)> {
        if force_offline || self.store.is_offline() {
            return self.read_stale(address);
        }

        match self.refresh(address).await {
            Ok(entry) => Ok((entry, Freshness::Live)),
            Err(
                e @ (WalletError::Provider(_) | WalletError::ProviderTimeout(_) | WalletError::ProviderRejected(_)),
            ) => {
                tracing::warn!("⚠️  Live UTXO fetch for {} failed, serving cache: {}", address, e);
                self.read_stale(address)
            }
            Err(e) => Err(e),
        }
    }

    /// Confirmed plus unconfirmed balance of `address`
    pub async fn balance(&self, address: &str, force_offline: bool) -> Result<(u64, Freshness)> {
        let (entry, freshness) = self.get_utxos(address, force_offline).await?;
        Ok((entry.balance, freshness))
    }

    /// Fetch `address` live and overwrite its entry. Fails instead of
    /// falling back; [`get_utxos`](Self::get_utxos) adds the fallback.
    pub async fn refresh(&self, address: &str) -> Result<CacheEntry> {
        if self.store.is_offline() {
            return Err(ProviderError::Offline.into());
        }
        let script_pubkey = address_to_script(address, self.network)?;

        let lock = self.key_lock(address).await;
        let result = {
            let _guard = lock.lock().await;
            self.fetch_and_store(address, script_pubkey).await
        };
        self.release_key_lock(address, lock).await;
        result
    }

    async fn fetch_and_store(&self, address: &str, script_pubkey: Vec<u8>) -> Result<CacheEntry> {
        let fetch = self.retry.run("utxo fetch", move || async move {
            let utxos = self.provider.get_address_utxos(address).await?;
            let tip = self.provider.get_tip_height().await?;
            Ok::<_, ProviderError>((utxos, tip))
        });
        let (provider_utxos, tip) = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout.as_secs()))??;

        if let Some(bad) = provider_utxos.iter().find(|u| u.value > MAX_MONEY) {
            return Err(ProviderError::ParseError(format!(
                "{}:{} value {} exceeds supply cap",
                bad.txid, bad.vout, bad.value
            ))
            .into());
        }
        let utxo_set = provider_utxos
            .into_iter()
            .map(|u| Utxo {
                confirmations: u.block_height.map(|h| tip.saturating_sub(h) + 1).unwrap_or(0),
                txid: u.txid.to_lowercase(),
                vout: u.vout,
                value: u.value,
                script_pubkey: script_pubkey.clone(),
            })
            .collect();

        let entry = self.put(address, utxo_set)?;
        tracing::info!(
            "🔄 Refreshed {} on {}: {} UTXOs, {} sats",
            address,
            self.network,
            entry.utxo_set.len(),
            entry.balance
        );
        Ok(entry)
    }

    /// Replace the entry for `address` with `utxo_set`
    pub fn put(&self, address: &str, utxo_set: Vec<Utxo>) -> Result<CacheEntry> {
        let entry = CacheEntry {
            network: self.network,
            address: address.to_string(),
            balance: sum_values(utxo_set.iter().map(|u| u.value)),
            utxo_set,
            fetched_at: unix_now(),
        };
        self.store.put_entry(&entry)?;
        Ok(entry)
    }

    /// Delete entries older than the TTL. No-op while offline, so a cold
    /// wallet never loses the only copy of its data.
    pub fn evict_expired(&self) -> Result<usize> {
        if self.store.is_offline() {
            tracing::debug!("Skipping cache eviction while offline");
            return Ok(0);
        }
        let cutoff = unix_now().saturating_sub(self.ttl.as_secs());
        let removed = self.store.delete_fetched_before(cutoff)?;
        if removed > 0 {
            tracing::info!("🧹 Evicted {} expired cache entries", removed);
        }
        Ok(removed)
    }

    fn read_stale(&self, address: &str) -> Result<(CacheEntry, Freshness)> {
        match self.store.get_entry(self.network, address)? {
            Some(entry) => {
                tracing::debug!("Serving cached entry for {} (fetched_at {})", address, entry.fetched_at);
                Ok((entry, Freshness::Stale))
            }
            None => Err(WalletError::CacheMiss {
                network: self.network.to_string(),
                address: address.to_string(),
            }),
        }
    }

    async fn key_lock(&self, address: &str) -> Arc<Mutex<()>> {
        self.fetch_locks
            .lock()
            .await
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map's entry for `address` once no other refresh holds `lock`
    async fn release_key_lock(&self, address: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.fetch_locks.lock().await;
        let unused = locks
            .get(address)
            .is_some_and(|current| Arc::ptr_eq(current, &lock) && Arc::strong_count(&lock) == 2);
        if unused {
            locks.remove(address);
        }
    }
}
