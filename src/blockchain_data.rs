//! Blockchain data access abstraction
//!
//! Provides a unified interface for the remote data the engine trusts:
//! address UTXOs, chain tip, mempool fee bands, transaction status and
//! broadcast. The default adapter speaks the Esplora dialect served by
//! mempool.space; nothing outside this module sees provider JSON.

use std::time::Duration;

use serde::Deserialize;

use crate::config::Network;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Network not supported: {0:?}")]
    UnsupportedNetwork(Network),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API timeout after {0}s")]
    Timeout(u64),

    #[error("Provider returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("{reason}")]
    Rejected { status: u16, reason: String },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Offline mode is enabled")]
    Offline,
}

impl ProviderError {
    /// Transport failures, timeouts and 5xx answers may succeed on retry;
    /// 4xx rejections and parse errors will not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::HttpError(_) | ProviderError::Timeout(_) | ProviderError::Server { .. }
        )
    }
}

/// Unspent output as the provider reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    /// None while unconfirmed
    pub block_height: Option<u32>,
}

/// Confirmation data for a known transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderTxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

/// Fee rates (sat/vB) at percentiles of the next projected block
#[derive(Debug, Clone, PartialEq)]
pub struct FeeBands {
    /// (percentile, rate) sorted by percentile
    pub bands: Vec<(u8, f64)>,
}

impl FeeBands {
    /// Percentiles of a mempool.space `feeRange` array of seven values
    const FEE_RANGE_PERCENTILES: [u8; 7] = [0, 10, 25, 50, 75, 90, 100];

    /// Interpret a `feeRange` array. Seven entries use the standard
    /// percentiles; any other length is spread evenly over 0..=100.
    pub fn from_fee_range(range: &[f64]) -> Option<Self> {
        if range.is_empty() || range.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return None;
        }
        let bands = if range.len() == Self::FEE_RANGE_PERCENTILES.len() {
            Self::FEE_RANGE_PERCENTILES.iter().copied().zip(range.iter().copied()).collect()
        } else if range.len() == 1 {
            vec![(0, range[0]), (100, range[0])]
        } else {
            let step = 100.0 / (range.len() - 1) as f64;
            range
                .iter()
                .enumerate()
                .map(|(i, r)| ((i as f64 * step).round() as u8, *r))
                .collect()
        };
        Some(Self { bands })
    }

    /// Rate at `percentile`, linearly interpolated between bands
    pub fn rate_at(&self, percentile: u8) -> f64 {
        let p = percentile.min(100);
        let mut lower = self.bands[0];
        for &(bp, rate) in &self.bands {
            if bp == p {
                return rate;
            }
            if bp > p {
                if bp == lower.0 {
                    return rate;
                }
                let span = (bp - lower.0) as f64;
                let t = (p - lower.0) as f64 / span;
                return lower.1 + (rate - lower.1) * t;
            }
            lower = (bp, rate);
        }
        lower.1
    }
}

/// Trait for accessing blockchain data from various sources
#[async_trait::async_trait]
pub trait BlockchainDataProvider: Send + Sync {
    fn network(&self) -> Network;

    /// Unspent outputs currently locked to `address`
    async fn get_address_utxos(&self, address: &str) -> Result<Vec<ProviderUtxo>, ProviderError>;

    /// Fetch current blockchain tip height
    async fn get_tip_height(&self) -> Result<u32, ProviderError>;

    /// Fee distribution of the next projected block
    async fn get_fee_bands(&self) -> Result<FeeBands, ProviderError>;

    /// Submit a raw transaction; returns the txid the provider reports
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ProviderError>;

    /// Status of `txid`, or None if the provider has never seen it
    async fn get_tx_status(&self, txid: &str) -> Result<Option<ProviderTxStatus>, ProviderError>;

    /// Human-facing explorer link for `txid`
    fn explorer_url(&self, _txid: &str) -> Option<String> {
        None
    }
}

/// mempool.space API implementation
pub struct MempoolSpaceApi {
    network: Network,
    base_url: Option<String>,
    timeout_secs: u64,
}

impl MempoolSpaceApi {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            base_url: None,
            timeout_secs: 10,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Point at a self-hosted Esplora/mempool instance
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self) -> Result<String, ProviderError> {
        if let Some(url) = &self.base_url {
            return Ok(url.clone());
        }
        match self.network {
            Network::Mainnet => Ok("https://mempool.space/api".to_string()),
            Network::Testnet => Ok("https://mempool.space/testnet/api".to_string()),
            Network::Signet => Ok("https://mempool.space/signet/api".to_string()),
            Network::Regtest => Err(ProviderError::UnsupportedNetwork(Network::Regtest)),
        }
    }

    fn client(&self) -> Result<reqwest::Client, ProviderError> {
        Ok(reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout_secs)
        } else {
            ProviderError::HttpError(e)
        }
    }

    /// Classify a response: 2xx passes, 4xx is a terminal rejection whose
    /// body is kept verbatim, 5xx is retryable
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ProviderError::Rejected { status: status.as_u16(), reason: body })
        } else {
            Err(ProviderError::Server { status: status.as_u16(), body })
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url()?, path);
        tracing::debug!("🌐 GET {}", url);
        let response = self
            .client()?
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u32>,
}

/// mempool.space projected block (only the fields used)
#[derive(Debug, Deserialize)]
struct MempoolBlock {
    #[serde(rename = "feeRange")]
    fee_range: Vec<f64>,
}

#[async_trait::async_trait]
impl BlockchainDataProvider for MempoolSpaceApi {
    fn network(&self) -> Network {
        self.network
    }

    async fn get_address_utxos(&self, address: &str) -> Result<Vec<ProviderUtxo>, ProviderError> {
        let response = Self::check_status(self.get(&format!("/address/{}/utxo", address)).await?).await?;
        let utxos: Vec<EsploraUtxo> = response.json().await?;

        tracing::debug!("Provider returned {} UTXOs for {}", utxos.len(), address);

        Ok(utxos
            .into_iter()
            .map(|u| ProviderUtxo {
                txid: u.txid,
                vout: u.vout,
                value: u.value,
                block_height: if u.status.confirmed { u.status.block_height } else { None },
            })
            .collect())
    }

    async fn get_tip_height(&self) -> Result<u32, ProviderError> {
        let response = Self::check_status(self.get("/blocks/tip/height").await?).await?;
        let height_str = response.text().await?;
        let height = height_str
            .trim()
            .parse::<u32>()
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        tracing::debug!("Current tip height: {}", height);

        Ok(height)
    }

    async fn get_fee_bands(&self) -> Result<FeeBands, ProviderError> {
        let response = Self::check_status(self.get("/v1/fees/mempool-blocks").await?).await?;
        let blocks: Vec<MempoolBlock> = response.json().await?;

        let next = blocks
            .first()
            .ok_or_else(|| ProviderError::ParseError("no projected mempool blocks".to_string()))?;
        FeeBands::from_fee_range(&next.fee_range)
            .ok_or_else(|| ProviderError::ParseError(format!("unusable feeRange {:?}", next.fee_range)))
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String, ProviderError> {
        let url = format!("{}/tx", self.base_url()?);
        tracing::debug!("🌐 POST {}", url);

        let response = self
            .client()?
            .post(&url)
            .body(raw_tx_hex.to_string())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let response = Self::check_status(response).await?;

        Ok(response.text().await?.trim().to_string())
    }

    async fn get_tx_status(&self, txid: &str) -> Result<Option<ProviderTxStatus>, ProviderError> {
        let response = self.get(&format!("/tx/{}/status", txid)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        let status: EsploraStatus = response.json().await?;

        Ok(Some(ProviderTxStatus {
            confirmed: status.confirmed,
            block_height: status.block_height,
        }))
    }

    fn explorer_url(&self, txid: &str) -> Option<String> {
        match self.network {
            Network::Mainnet => Some(format!("https://mempool.space/tx/{}", txid)),
            Network::Testnet => Some(format!("https://mempool.space/testnet/tx/{}", txid)),
            Network::Signet => Some(format!("https://mempool.space/signet/tx/{}", txid)),
            Network::Regtest => None,
        }
    }
}
