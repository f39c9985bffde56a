//! Broadcast and confirmation tracking
//!
//! Every provider call goes through the configured [`RetryPolicy`], so
//! transport failures, timeouts and 5xx answers are retried with backoff
//! while a 4xx rejection surfaces at once with the provider's reason.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::blockchain_data::{BlockchainDataProvider, ProviderError};
use crate::cache::UtxoCache;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::types::TxStatus;

/// How [`BroadcastGateway::track`] polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOptions {
    pub interval: Duration,
    /// Polls before giving up and returning the last status seen
    pub max_polls: usize,
}

impl Default for TrackOptions {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30), max_polls: 120 }
    }
}

pub struct BroadcastGateway {
    provider: Arc<dyn BlockchainDataProvider>,
    retry: RetryPolicy,
    timeout: Duration,
    cache: Option<Arc<UtxoCache>>,
}

impl BroadcastGateway {
    pub fn new(provider: Arc<dyn BlockchainDataProvider>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { provider, retry, timeout, cache: None }
    }

    /// Refresh this cache when a tracked transaction confirms. Its offline
    /// flag also blocks broadcasts.
    pub fn with_cache(mut self, cache: Arc<UtxoCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Submit `raw_tx_hex`; returns the txid the provider accepted
    pub async fn broadcast(&self, raw_tx_hex: &str) -> Result<String> {
        self.ensure_online()?;
        let raw = raw_tx_hex.trim();

        info!("📡 Broadcasting transaction ({} bytes)", raw.len() / 2);
        let txid = self
            .retry
            .run("broadcast", move || self.bounded(self.provider.broadcast(raw)))
            .await
            .inspect_err(|e| warn!("❌ Broadcast failed: {}", e))?;

        info!("✅ Broadcast accepted: {}", txid);
        Ok(txid)
    }

    /// Current confirmation state of `txid`
    pub async fn status(&self, txid: &str) -> Result<TxStatus> {
        self.ensure_online()?;
        let status = self
            .retry
            .run("tx status", move || self.bounded(self.provider.get_tx_status(txid)))
            .await?;

        let status = match status {
            None => TxStatus::NotFound,
            Some(s) if !s.confirmed => TxStatus::Unconfirmed,
            Some(s) => {
                let height = s.block_height.ok_or_else(|| {
                    ProviderError::ParseError(format!("{} confirmed without a block height", txid))
                })?;
                let tip = self
                    .retry
                    .run("tip height", move || self.bounded(self.provider.get_tip_height()))
                    .await?;
                TxStatus::Confirmed { height, confirmations: tip.saturating_sub(height) + 1 }
            }
        };
        debug!("Status of {}: {:?}", txid, status);
        Ok(status)
    }

    /// Poll `txid` until it confirms or `options.max_polls` is reached.
    /// On confirmation the cache entries of `addresses` are refreshed.
    pub async fn track(&self, txid: &str, addresses: &[String], options: TrackOptions) -> Result<TxStatus> {
        let mut last = TxStatus::NotFound;
        for poll in 1..=options.max_polls.max(1) {
            last = self.status(txid).await?;
            if matches!(last, TxStatus::Confirmed { .. }) {
                info!("⛏️  {} confirmed after {} poll(s)", txid, poll);
                self.refresh_addresses(addresses).await;
                return Ok(last);
            }
            if poll < options.max_polls {
                tokio::time::sleep(options.interval).await;
            }
        }
        info!("⏳ Stopped tracking {} while {:?}", txid, last);
        Ok(last)
    }

    pub fn explorer_url(&self, txid: &str) -> Option<String> {
        self.provider.explorer_url(txid)
    }

    async fn refresh_addresses(&self, addresses: &[String]) {
        let Some(cache) = &self.cache else {
            return;
        };
        for address in addresses {
            if let Err(e) = cache.refresh(address).await {
                warn!("⚠️  Could not refresh {} after confirmation: {}", address, e);
            }
        }
    }

    fn ensure_online(&self) -> Result<()> {
        match &self.cache {
            Some(cache) if cache.store().is_offline() => Err(ProviderError::Offline.into()),
            _ => Ok(()),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, ProviderError>>,
    ) -> std::result::Result<T, ProviderError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout.as_secs()))?
    }
}
