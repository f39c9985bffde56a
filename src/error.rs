//! Error taxonomy for the transaction engine
//!
//! Build, sign and validate errors are deterministic and returned to the
//! caller unchanged. Provider errors are retried by the gateway and only
//! surface once retries are exhausted.

use crate::types::ScriptType;

/// Errors returned by every engine operation
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Insufficient funds: have {available} sats, need {required} sats (outputs + fee)")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Invalid output {index}: {reason}")]
    InvalidOutput { index: usize, reason: String },

    #[error("Invalid input {index}: {reason}")]
    InvalidInput { index: usize, reason: String },

    #[error("Invalid fee rate: {0} sat/vB")]
    InvalidFeeRate(f64),

    #[error("Unsupported script type: {0}")]
    UnsupportedScriptType(String),

    #[error("Key does not match locking script of input {index} ({script_type})")]
    KeyMismatch { index: usize, script_type: ScriptType },

    #[error("No cached data for {address} on {network}")]
    CacheMiss { network: String, address: String },

    #[error("Outputs ({outputs} sats) exceed inputs ({inputs} sats)")]
    NegativeFee { inputs: u64, outputs: u64 },

    #[error("Provider timed out after {0}s")]
    ProviderTimeout(u64),

    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Builder backends disagree on serialization of {txid}")]
    SerializationMismatch { txid: String },

    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Prevout {txid}:{vout} of input {index} not supplied")]
    UnknownPrevout { index: usize, txid: String, vout: u32 },

    #[error("Input index {index} out of range ({count} inputs)")]
    InvalidInputIndex { index: usize, count: usize },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hex::FromHexError> for WalletError {
    fn from(e: hex::FromHexError) -> Self {
        WalletError::MalformedTransaction(format!("invalid hex: {}", e))
    }
}

impl From<crate::blockchain_data::ProviderError> for WalletError {
    fn from(e: crate::blockchain_data::ProviderError) -> Self {
        use crate::blockchain_data::ProviderError;
        match e {
            ProviderError::Timeout(secs) => WalletError::ProviderTimeout(secs),
            ProviderError::Rejected { reason, .. } => WalletError::ProviderRejected(reason),
            other => WalletError::Provider(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
