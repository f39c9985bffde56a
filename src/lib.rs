// Library interface for coldwallet
// Exposes public modules for the binary and integration tests

pub mod blockchain_data;
pub mod broadcast;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fee;
pub mod hooks;
pub mod keys;
pub mod retry;
pub mod signer;
pub mod store;
pub mod types;
pub mod validator;

pub use builder::{BuildRequest, BuilderBackend, BuiltTransaction, InputSource, TransactionBuilder};
pub use engine::{FeeChoice, SendRequest, WalletEngine};
pub use error::{Result, WalletError};
pub use hooks::{NoopHooks, WalletHooks};
pub use types::{
    CacheEntry, FeeEstimate, Freshness, OutPoint, Priority, ScriptType, SignedTransaction, TxInput, TxOutput,
    TxStatus, UnsignedTransaction, Utxo,
};
