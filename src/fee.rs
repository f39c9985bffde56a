//! Fee estimation from mempool fee bands with cached and static fallbacks
//!
//! A live estimate reads the fee distribution of the next projected block
//! and picks the percentile configured for the requested priority. When the
//! provider is unreachable, slow, or there is no public provider (regtest),
//! the last live estimate for (network, priority) is served instead, then
//! the configured default. Fallbacks are marked `FeeSource::Cached`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::blockchain_data::{BlockchainDataProvider, FeeBands, ProviderError};
use crate::config::{FeePolicy, Network};
use crate::retry::RetryPolicy;
use crate::store::OfflineStore;
use crate::types::{unix_now, FeeEstimate, FeeSource, Priority};

/// Floor applied to live rates; nodes do not relay below 1 sat/vB
const MIN_RELAY_RATE: f64 = 1.0;

/// Fee estimator with an in-memory and a persistent fallback
pub struct FeeEstimator {
    provider: Arc<dyn BlockchainDataProvider>,
    store: OfflineStore,
    policy: FeePolicy,
    retry: RetryPolicy,
    /// Bound on a whole live fetch, retries included
    timeout: Duration,
    cache: Arc<RwLock<HashMap<(Network, Priority), FeeEstimate>>>,
}

impl FeeEstimator {
    pub fn new(
        provider: Arc<dyn BlockchainDataProvider>,
        store: OfflineStore,
        policy: FeePolicy,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            policy,
            retry,
            timeout,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    /// Fee rate for `priority` on `network`. Never fails: provider errors
    /// and timeouts resolve to a cached or default estimate.
    pub async fn estimate(&self, priority: Priority, network: Network) -> FeeEstimate {
        match self.fetch_bands(network).await {
            Ok(bands) => self.record_live(&bands, priority, network).await,
            Err(e) => {
                tracing::warn!("⚠️  Live fee estimate unavailable for {} ({}): {}", network, priority, e);
                self.fallback(priority, network).await
            }
        }
    }

    /// Estimates for every priority from a single provider round trip
    pub async fn fee_table(&self, network: Network) -> Vec<FeeEstimate> {
        match self.fetch_bands(network).await {
            Ok(bands) => {
                let mut table = Vec::with_capacity(Priority::ALL.len());
                for priority in Priority::ALL {
                    table.push(self.record_live(&bands, priority, network).await);
                }
                table
            }
            Err(e) => {
                tracing::warn!("⚠️  Live fee table unavailable for {}: {}", network, e);
                let mut table = Vec::with_capacity(Priority::ALL.len());
                for priority in Priority::ALL {
                    table.push(self.fallback(priority, network).await);
                }
                table
            }
        }
    }

    async fn fetch_bands(&self, network: Network) -> Result<FeeBands, ProviderError> {
        if network == Network::Regtest || network != self.provider.network() {
            return Err(ProviderError::UnsupportedNetwork(network));
        }
        if self.store.is_offline() {
            return Err(ProviderError::Offline);
        }

        let fetch = self.retry.run("fee bands", move || self.provider.get_fee_bands());
        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.timeout.as_secs())),
        }
    }

    async fn record_live(&self, bands: &FeeBands, priority: Priority, network: Network) -> FeeEstimate {
        let percentile = self.policy.percentile(priority);
        let estimate = FeeEstimate {
            rate_sat_per_vbyte: bands.rate_at(percentile).max(MIN_RELAY_RATE),
            priority,
            source: FeeSource::Live,
            network,
            fetched_at: unix_now(),
        };

        tracing::info!(
            "Fee estimate: {:.2} sat/vB for {} (p{}) on {}",
            estimate.rate_sat_per_vbyte,
            priority,
            percentile,
            network
        );

        self.cache.write().await.insert((network, priority), estimate.clone());
        if let Err(e) = self.store.put_fee(&estimate) {
            tracing::warn!("Failed to persist fee estimate: {}", e);
        }
        estimate
    }

    /// In-memory estimate, then the persisted one, then the configured default
    async fn fallback(&self, priority: Priority, network: Network) -> FeeEstimate {
        if let Some(cached) = self.cache.read().await.get(&(network, priority)) {
            tracing::debug!("Using cached fee estimate: {:.2} sat/vB", cached.rate_sat_per_vbyte);
            return FeeEstimate { source: FeeSource::Cached, ..cached.clone() };
        }

        match self.store.get_fee(network, priority) {
            Ok(Some(stored)) => {
                tracing::debug!("Using stored fee estimate: {:.2} sat/vB", stored.rate_sat_per_vbyte);
                return stored;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read stored fee estimate: {}", e),
        }

        let rate = self.policy.default_rate(network, priority);
        tracing::debug!("Using default fee rate: {:.2} sat/vB", rate);
        FeeEstimate {
            rate_sat_per_vbyte: rate,
            priority,
            source: FeeSource::Cached,
            network,
            fetched_at: unix_now(),
        }
    }

    /// Clear the in-memory estimates (the persisted ones remain)
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}
