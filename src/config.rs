//! Configuration management for the engine
//!
//! Policy values that the rest of the crate treats as tunable (fee
//! percentile mapping, default fee rates, dust threshold, timeouts, retry
//! budget) live here with documented defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::builder::BuilderBackend;
use crate::retry::RetryPolicy;
use crate::types::Priority;

/// Network type for Bitcoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }

    pub fn to_bdk_network(&self) -> bdk_wallet::bitcoin::Network {
        match self {
            Network::Mainnet => bdk_wallet::bitcoin::Network::Bitcoin,
            Network::Testnet => bdk_wallet::bitcoin::Network::Testnet,
            Network::Signet => bdk_wallet::bitcoin::Network::Signet,
            Network::Regtest => bdk_wallet::bitcoin::Network::Regtest,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(anyhow::anyhow!("Invalid network: {}", s)),
        }
    }
}

/// Fallback rates (sat/vB) used when neither the provider nor the fallback
/// store can answer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefaultRates {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl DefaultRates {
    pub fn for_priority(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Low => self.low,
            Priority::Medium => self.medium,
            Priority::High => self.high,
        }
    }
}

/// Fee estimation policy
///
/// Priorities map to a percentile of the fee rates in the next projected
/// block: low → 10th, medium → 50th, high → 90th. Defaults lean high so a
/// fallback estimate still confirms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub low_percentile: u8,
    pub medium_percentile: u8,
    pub high_percentile: u8,
    pub mainnet_defaults: DefaultRates,
    pub test_defaults: DefaultRates,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            low_percentile: 10,
            medium_percentile: 50,
            high_percentile: 90,
            mainnet_defaults: DefaultRates { low: 5.0, medium: 10.0, high: 20.0 },
            test_defaults: DefaultRates { low: 1.0, medium: 2.0, high: 5.0 },
        }
    }
}

impl FeePolicy {
    pub fn percentile(&self, priority: Priority) -> u8 {
        match priority {
            Priority::Low => self.low_percentile,
            Priority::Medium => self.medium_percentile,
            Priority::High => self.high_percentile,
        }
    }

    pub fn default_rate(&self, network: Network, priority: Priority) -> f64 {
        match network {
            Network::Mainnet => self.mainnet_defaults.for_priority(priority),
            _ => self.test_defaults.for_priority(priority),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin network to use
    pub network: Network,

    /// Directory holding the offline cache and logs
    pub data_dir: PathBuf,

    /// Override for the Esplora-compatible provider base URL
    #[serde(default)]
    pub provider_url: Option<String>,

    /// Bound on every provider request
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Age after which cache entries may be evicted (online only)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Change below or equal to this many sats is added to the fee
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold: u64,

    #[serde(default)]
    pub builder: BuilderBackend,

    #[serde(default)]
    pub fee_policy: FeePolicy,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            data_dir: default_data_dir(),
            provider_url: None,
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            dust_threshold: default_dust_threshold(),
            builder: BuilderBackend::default(),
            fee_policy: FeePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = config_file_path()?;

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            tracing::info!("📝 Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            tracing::info!("📝 No config file found, creating default at: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_file_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        tracing::info!("💾 Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Directory for this network's cache and logs
    pub fn network_data_dir(&self) -> PathBuf {
        self.data_dir.join(self.network.as_str())
    }

    /// SQLite file backing the offline store
    pub fn cache_db_path(&self) -> PathBuf {
        self.network_data_dir().join("cache.sqlite")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let p = &self.fee_policy;
        if p.high_percentile > 100 {
            return Err(anyhow::anyhow!("Fee percentiles must be within 0..=100"));
        }
        if !(p.low_percentile <= p.medium_percentile && p.medium_percentile <= p.high_percentile) {
            return Err(anyhow::anyhow!(
                "Fee percentiles must be ordered low <= medium <= high, got {}/{}/{}",
                p.low_percentile,
                p.medium_percentile,
                p.high_percentile
            ));
        }
        for rates in [&p.mainnet_defaults, &p.test_defaults] {
            if [rates.low, rates.medium, rates.high].iter().any(|r| !r.is_finite() || *r <= 0.0) {
                return Err(anyhow::anyhow!("Default fee rates must be positive"));
            }
        }
        if self.timeout_secs == 0 {
            return Err(anyhow::anyhow!("timeout_secs must be nonzero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be at least 1"));
        }

        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Cannot create data directory: {}", self.data_dir.display()))?;
        }

        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_dust_threshold() -> u64 {
    546
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "coldwallet")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".coldwallet")
        })
}

/// Get the configuration file path
fn config_file_path() -> Result<PathBuf> {
    let config_dir = directories::ProjectDirs::from("", "", "coldwallet")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("coldwallet")
        });

    Ok(config_dir.join("config.toml"))
}

/// Get the config file path for display purposes
pub fn get_config_path() -> Result<PathBuf> {
    config_file_path()
}
