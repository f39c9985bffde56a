//! Wallet storage hooks
//!
//! The engine never owns wallet persistence. A host wallet plugs in here to
//! learn about finalized transactions and to contribute UTXOs it tracks
//! itself (for example change outputs the provider has not indexed yet).

use serde::{Deserialize, Serialize};

use crate::builder::BuilderBackend;
use crate::error::Result;
use crate::types::{SignedTransaction, Utxo};

/// What the engine knows about a transaction when it is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub txid: String,
    pub raw_hex: String,
    pub fee: u64,
    pub fee_rate_sat_per_vbyte: f64,
    pub vsize: u64,
    pub change_index: Option<usize>,
    pub backend: BuilderBackend,
    /// Addresses whose UTXOs were offered as candidates
    pub source_addresses: Vec<String>,
}

#[async_trait::async_trait]
pub trait WalletHooks: Send + Sync {
    /// Called once a transaction is signed and validated, before any broadcast
    async fn on_transaction_finalized(&self, signed: &SignedTransaction, metadata: &TransactionMetadata) -> Result<()>;

    /// Extra UTXOs for `address`, merged into the candidate set
    async fn known_utxos(&self, address: &str) -> Result<Vec<Utxo>>;
}

/// Hooks that store nothing and know nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait::async_trait]
impl WalletHooks for NoopHooks {
    async fn on_transaction_finalized(&self, _signed: &SignedTransaction, _metadata: &TransactionMetadata) -> Result<()> {
        Ok(())
    }

    async fn known_utxos(&self, _address: &str) -> Result<Vec<Utxo>> {
        Ok(Vec::new())
    }
}
