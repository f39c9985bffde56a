//! Engine-neutral data model shared by the builder backends, signer,
//! validator and cache.
//!
//! Transactions are kept in a plain representation so that the two builder
//! backends can encode them independently. An [`UnsignedTransaction`] pairs
//! the transaction with the UTXOs it spends, the same way a PSBT carries
//! `witness_utxo` for each input.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::Network;
use crate::error::{Result, WalletError};

/// Total supply cap in satoshis
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// nSequence used for every input the builder creates (RBF, no locktime)
pub const SEQUENCE_RBF: u32 = 0xFFFF_FFFD;

/// Transaction version produced by the builder
pub const TX_VERSION: i32 = 2;

/// Locking script forms the signer and validator understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    /// Pay-to-pubkey-hash (legacy)
    P2pkh,
    /// Pay-to-script-hash wrapping a P2WPKH program (nested SegWit)
    P2sh,
    /// Native SegWit v0 pubkey hash
    P2wpkh,
    /// Taproot key-path (BIP86)
    P2tr,
}

impl ScriptType {
    pub const ALL: [ScriptType; 4] = [
        ScriptType::P2pkh,
        ScriptType::P2sh,
        ScriptType::P2wpkh,
        ScriptType::P2tr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2tr => "p2tr",
        }
    }

    /// Recognise the script type of a locking script
    pub fn classify(script_pubkey: &[u8]) -> Result<Self> {
        match script_pubkey {
            [0x76, 0xa9, 0x14, .., 0x88, 0xac] if script_pubkey.len() == 25 => Ok(ScriptType::P2pkh),
            [0xa9, 0x14, .., 0x87] if script_pubkey.len() == 23 => Ok(ScriptType::P2sh),
            [0x00, 0x14, ..] if script_pubkey.len() == 22 => Ok(ScriptType::P2wpkh),
            [0x51, 0x20, ..] if script_pubkey.len() == 34 => Ok(ScriptType::P2tr),
            _ => Err(WalletError::UnsupportedScriptType(format!(
                "unrecognised locking script {}",
                hex::encode(script_pubkey)
            ))),
        }
    }

    /// Weight units an input of this type adds once signed.
    ///
    /// Non-witness bytes count 4 WU each, witness bytes 1 WU. Signatures are
    /// assumed at their maximum DER length (72 bytes incl. hashtype).
    pub fn input_weight(&self) -> u64 {
        // outpoint(36) + sequence(4)
        const FIXED: u64 = 40;
        match self {
            // scriptSig: len(1) + push sig(1+72) + push pubkey(1+33)
            ScriptType::P2pkh => (FIXED + 1 + 1 + 72 + 1 + 33) * 4,
            // scriptSig: len(1) + push redeem(1+22); witness: count(1) + sig(1+72) + pubkey(1+33)
            ScriptType::P2sh => (FIXED + 1 + 23) * 4 + 1 + 1 + 72 + 1 + 33,
            // empty scriptSig; witness as above
            ScriptType::P2wpkh => (FIXED + 1) * 4 + 1 + 1 + 72 + 1 + 33,
            // empty scriptSig; witness: count(1) + sig(1+64)
            ScriptType::P2tr => (FIXED + 1) * 4 + 1 + 1 + 64,
        }
    }

    pub fn is_witness(&self) -> bool {
        !matches!(self, ScriptType::P2pkh)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "p2pkh" | "legacy" => Ok(ScriptType::P2pkh),
            "p2sh" | "p2sh-p2wpkh" => Ok(ScriptType::P2sh),
            "p2wpkh" | "segwit" => Ok(ScriptType::P2wpkh),
            "p2tr" | "taproot" => Ok(ScriptType::P2tr),
            other => Err(WalletError::UnsupportedScriptType(other.to_string())),
        }
    }
}

/// Reference to a previous transaction output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    /// Txid in display (big-endian) hex
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self { txid: txid.into().to_lowercase(), vout }
    }

    /// Txid bytes in internal (little-endian) order, as they appear on the wire
    pub fn txid_bytes(&self) -> Result<[u8; 32]> {
        let mut bytes: [u8; 32] = hex::decode(&self.txid)?
            .try_into()
            .map_err(|_| WalletError::MalformedTransaction(format!("txid {} is not 32 bytes", self.txid)))?;
        bytes.reverse();
        Ok(bytes)
    }

    pub fn from_txid_bytes(wire: [u8; 32], vout: u32) -> Self {
        let mut display = wire;
        display.reverse();
        Self { txid: hex::encode(display), vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// An unspent output as reported by the provider or supplied by the caller.
/// Immutable once fetched; a refresh supersedes the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(with = "hex::serde")]
    pub script_pubkey: Vec<u8>,
    pub confirmations: u32,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid.clone(), self.vout)
    }

    pub fn script_type(&self) -> Result<ScriptType> {
        ScriptType::classify(&self.script_pubkey)
    }

    /// value <= MAX_MONEY; `index` is the input this UTXO funds
    pub fn check_value(&self, index: usize) -> Result<()> {
        if self.value > MAX_MONEY {
            return Err(WalletError::InvalidInput {
                index,
                reason: format!("prevout {} value {} exceeds supply cap", self.outpoint(), self.value),
            });
        }
        Ok(())
    }
}

/// Fails on the first outpoint already spent by an earlier input
pub fn check_distinct_outpoints<'a>(outpoints: impl IntoIterator<Item = &'a OutPoint>) -> Result<()> {
    let mut seen = HashSet::new();
    for (index, outpoint) in outpoints.into_iter().enumerate() {
        if !seen.insert(outpoint) {
            return Err(WalletError::InvalidInput { index, reason: format!("{} is spent twice", outpoint) });
        }
    }
    Ok(())
}

/// Sum of sat values; saturates instead of overflowing
pub fn sum_values(values: impl IntoIterator<Item = u64>) -> u64 {
    values.into_iter().fold(0, u64::saturating_add)
}

/// Payment destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    #[serde(with = "hex::serde")]
    pub script_pubkey: Vec<u8>,
    pub value: u64,
}

impl TxOutput {
    pub fn new(script_pubkey: Vec<u8>, value: u64) -> Self {
        Self { script_pubkey, value }
    }

    /// Build an output paying `value` sats to `address` on `network`
    pub fn to_address(address: &str, network: Network, value: u64) -> Result<Self> {
        Ok(Self {
            script_pubkey: crate::keys::address_to_script(address, network)?,
            value,
        })
    }

    /// 0 < value <= MAX_MONEY
    pub fn check_value(&self, index: usize) -> Result<()> {
        if self.value == 0 {
            return Err(WalletError::InvalidOutput { index, reason: "value must be positive".into() });
        }
        if self.value > MAX_MONEY {
            return Err(WalletError::InvalidOutput {
                index,
                reason: format!("value {} exceeds supply cap", self.value),
            });
        }
        Ok(())
    }

    /// Weight of the serialized output
    pub fn weight(&self) -> u64 {
        (8 + varint_len(self.script_pubkey.len() as u64) + self.script_pubkey.len() as u64) * 4
    }
}

/// Transaction input; `script_sig` and `witness` stay empty until signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    #[serde(with = "hex::serde")]
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    #[serde(default)]
    pub witness: Vec<Vec<u8>>,
}

impl TxInput {
    pub fn unsigned(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script_sig: Vec::new(),
            sequence: SEQUENCE_RBF,
            witness: Vec::new(),
        }
    }

    pub fn has_proof(&self) -> bool {
        !self.script_sig.is_empty() || !self.witness.is_empty()
    }
}

/// Consensus-level transaction. Input and output order is significant and
/// preserved by every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub lock_time: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn output_total(&self) -> u64 {
        sum_values(self.outputs.iter().map(|o| o.value))
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    pub fn has_any_proof(&self) -> bool {
        self.inputs.iter().any(TxInput::has_proof)
    }

    pub fn is_fully_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(TxInput::has_proof)
    }
}

/// A transaction together with the UTXOs it spends (one per input, same order)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub prevouts: Vec<Utxo>,
}

impl UnsignedTransaction {
    /// Pair a transaction with its prevouts, checking they line up
    pub fn new(tx: Transaction, prevouts: Vec<Utxo>) -> Result<Self> {
        if tx.inputs.len() != prevouts.len() {
            return Err(WalletError::MalformedTransaction(format!(
                "{} inputs but {} prevouts",
                tx.inputs.len(),
                prevouts.len()
            )));
        }
        for (index, (input, utxo)) in tx.inputs.iter().zip(&prevouts).enumerate() {
            if input.previous_output != utxo.outpoint() {
                return Err(WalletError::UnknownPrevout {
                    index,
                    txid: input.previous_output.txid.clone(),
                    vout: input.previous_output.vout,
                });
            }
        }
        Ok(Self { tx, prevouts })
    }

    pub fn input_total(&self) -> u64 {
        sum_values(self.prevouts.iter().map(|u| u.value))
    }

    pub fn fee(&self) -> Result<u64> {
        let (inputs, outputs) = (self.input_total(), self.tx.output_total());
        inputs
            .checked_sub(outputs)
            .ok_or(WalletError::NegativeFee { inputs, outputs })
    }
}

/// Fully signed transaction: every input carries its unlocking proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub prevouts: Vec<Utxo>,
}

impl SignedTransaction {
    pub fn fee(&self) -> u64 {
        sum_values(self.prevouts.iter().map(|u| u.value)).saturating_sub(self.tx.output_total())
    }
}

/// Fee priority tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            _ => Err(anyhow::anyhow!("Invalid priority: {}", s)),
        }
    }
}

/// Where a fee estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSource {
    Live,
    Cached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub rate_sat_per_vbyte: f64,
    pub priority: Priority,
    pub source: FeeSource,
    pub network: Network,
    /// Unix seconds
    pub fetched_at: u64,
}

/// Whether cached data came from a live fetch just now or from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Live,
    Stale,
}

/// Address snapshot held by the offline store. Live and stale reads return
/// this same structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub network: Network,
    pub address: String,
    pub balance: u64,
    pub utxo_set: Vec<Utxo>,
    /// Unix seconds of the live fetch that produced this entry
    pub fetched_at: u64,
}

/// Confirmation state reported by the status gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Unconfirmed,
    Confirmed { height: u32, confirmations: u32 },
    NotFound,
}

/// Length of a Bitcoin CompactSize encoding
pub fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub(crate) fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
