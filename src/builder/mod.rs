//! Transaction building
//!
//! Planning (input selection, fee, change) is shared; serialization goes
//! through one of two interchangeable backends:
//! - [`library::LibraryBuilder`]: consensus encoding from the `bitcoin` crate
//! - [`reference::ReferenceBuilder`]: hand-written wire encoding
//!
//! Both must produce identical bytes for the same transaction.
//! [`cross_check`] enforces that at runtime.

pub mod coin_selection;
pub mod library;
pub mod reference;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WalletError};
use crate::types::{
    check_distinct_outpoints, sum_values, varint_len, OutPoint, ScriptType, Transaction, TxInput, TxOutput, UnsignedTransaction, Utxo, TX_VERSION,
};

pub use library::LibraryBuilder;
pub use reference::ReferenceBuilder;

/// Default change threshold in sats; change at or below it goes to the fee
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

/// Serialization backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderBackend {
    #[default]
    Library,
    Reference,
}

impl BuilderBackend {
    pub const ALL: [BuilderBackend; 2] = [BuilderBackend::Library, BuilderBackend::Reference];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderBackend::Library => "library",
            BuilderBackend::Reference => "reference",
        }
    }

    pub fn builder(&self) -> &'static dyn TransactionBuilder {
        match self {
            BuilderBackend::Library => &LibraryBuilder,
            BuilderBackend::Reference => &ReferenceBuilder,
        }
    }
}

impl fmt::Display for BuilderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BuilderBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "library" | "lib" => Ok(BuilderBackend::Library),
            "reference" | "ref" => Ok(BuilderBackend::Reference),
            _ => Err(anyhow::anyhow!("Invalid builder backend: {}", s)),
        }
    }
}

/// Where the inputs of a build come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Spend exactly these, in this order
    Explicit(Vec<Utxo>),
    /// Choose from these with largest-first selection
    Candidates(Vec<Utxo>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub inputs: InputSource,
    pub outputs: Vec<TxOutput>,
    pub fee_rate: f64,
    /// Change destination; defaults to the first selected input's script
    pub change_script: Option<Vec<u8>>,
    pub dust_threshold: u64,
}

impl BuildRequest {
    pub fn new(inputs: InputSource, outputs: Vec<TxOutput>, fee_rate: f64) -> Self {
        Self {
            inputs,
            outputs,
            fee_rate,
            change_script: None,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
        }
    }

    pub fn with_change_script(mut self, script: Vec<u8>) -> Self {
        self.change_script = Some(script);
        self
    }

    pub fn with_dust_threshold(mut self, dust_threshold: u64) -> Self {
        self.dust_threshold = dust_threshold;
        self
    }
}

/// Output of a build: the unsigned transaction plus what the builder decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltTransaction {
    pub unsigned: UnsignedTransaction,
    pub fee: u64,
    /// Position of the change output, if one was added
    pub change_index: Option<usize>,
    /// Virtual size once signed, as estimated for the fee
    pub estimated_vsize: u64,
    pub raw_hex: String,
    pub txid: String,
    pub backend: BuilderBackend,
}

impl BuiltTransaction {
    pub fn change_value(&self) -> Option<u64> {
        self.change_index.map(|i| self.unsigned.tx.outputs[i].value)
    }
}

/// A serialization backend
pub trait TransactionBuilder: Send + Sync {
    fn backend(&self) -> BuilderBackend;

    /// Consensus serialization; witness format when any input has a witness
    fn encode(&self, tx: &Transaction) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Transaction>;

    /// Txid in display hex (hash of the non-witness serialization)
    fn txid(&self, tx: &Transaction) -> Result<String>;

    /// Plan and serialize `request`
    fn build(&self, request: &BuildRequest) -> Result<BuiltTransaction> {
        let plan = plan(request)?;
        let raw = self.encode(&plan.unsigned.tx)?;
        let txid = self.txid(&plan.unsigned.tx)?;

        info!(
            "🔨 Built {} ({}): {} inputs, {} outputs, fee {} sats",
            txid,
            self.backend(),
            plan.unsigned.tx.inputs.len(),
            plan.unsigned.tx.outputs.len(),
            plan.fee
        );

        Ok(BuiltTransaction {
            unsigned: plan.unsigned,
            fee: plan.fee,
            change_index: plan.change_index,
            estimated_vsize: plan.weight.div_ceil(4),
            raw_hex: hex::encode(raw),
            txid,
            backend: self.backend(),
        })
    }
}

/// Build with the given backend
pub fn build(backend: BuilderBackend, request: &BuildRequest) -> Result<BuiltTransaction> {
    backend.builder().build(request)
}

/// Encode `tx` with both backends; fails if the bytes differ
pub fn cross_check(tx: &Transaction) -> Result<Vec<u8>> {
    let library = LibraryBuilder.encode(tx)?;
    let reference = ReferenceBuilder.encode(tx)?;
    if library != reference {
        let txid = LibraryBuilder.txid(tx).unwrap_or_else(|_| "<unknown>".to_string());
        tracing::error!("❌ Backends disagree on serialization of {}", txid);
        return Err(WalletError::SerializationMismatch { txid });
    }
    Ok(library)
}

/// Weight of the signed transaction spending inputs of `input_types` into
/// `outputs`
pub fn estimate_weight(input_types: &[ScriptType], outputs: &[TxOutput]) -> u64 {
    // version(4) + locktime(4) + input and output counts
    let base = (8 + varint_len(input_types.len() as u64) + varint_len(outputs.len() as u64)) * 4;
    let inputs: u64 = input_types.iter().map(ScriptType::input_weight).sum();
    let outputs: u64 = outputs.iter().map(TxOutput::weight).sum();

    let has_witness = input_types.iter().any(ScriptType::is_witness);
    let witness_extra = if has_witness {
        // marker + flag, and an empty witness stack for each legacy input
        let legacy = input_types.iter().filter(|t| !t.is_witness()).count() as u64;
        2 + legacy
    } else {
        0
    };

    base + inputs + outputs + witness_extra
}

/// Fee in sats for `weight` at `fee_rate` sat/vB, rounded up
pub fn fee_for_weight(weight: u64, fee_rate: f64) -> u64 {
    (weight as f64 * fee_rate / 4.0).ceil() as u64
}

pub(crate) fn fee_for(input_types: &[ScriptType], outputs: &[TxOutput], fee_rate: f64) -> u64 {
    fee_for_weight(estimate_weight(input_types, outputs), fee_rate)
}

/// Backend-independent result of planning a build
struct Plan {
    unsigned: UnsignedTransaction,
    fee: u64,
    change_index: Option<usize>,
    weight: u64,
}

fn plan(request: &BuildRequest) -> Result<Plan> {
    if !request.fee_rate.is_finite() || request.fee_rate < 0.0 {
        return Err(WalletError::InvalidFeeRate(request.fee_rate));
    }
    if request.outputs.is_empty() {
        return Err(WalletError::InvalidOutput { index: 0, reason: "no outputs".into() });
    }
    for (index, output) in request.outputs.iter().enumerate() {
        output.check_value(index)?;
    }
    let output_total = sum_values(request.outputs.iter().map(|o| o.value));

    let selected = match &request.inputs {
        InputSource::Explicit(utxos) => {
            for (index, utxo) in utxos.iter().enumerate() {
                utxo.check_value(index)?;
            }
            let outpoints: Vec<OutPoint> = utxos.iter().map(Utxo::outpoint).collect();
            check_distinct_outpoints(&outpoints)?;

            let types = utxos.iter().map(Utxo::script_type).collect::<Result<Vec<_>>>()?;
            let available = sum_values(utxos.iter().map(|u| u.value));
            let required = output_total.saturating_add(fee_for(&types, &request.outputs, request.fee_rate));
            if utxos.is_empty() || available < required {
                return Err(WalletError::InsufficientFunds { available, required });
            }
            utxos.clone()
        }
        InputSource::Candidates(candidates) => {
            coin_selection::select_largest_first(candidates, &request.outputs, request.fee_rate)?
        }
    };

    let input_types = selected.iter().map(Utxo::script_type).collect::<Result<Vec<_>>>()?;
    let input_total = sum_values(selected.iter().map(|u| u.value));

    let change_script = match &request.change_script {
        Some(script) => script.clone(),
        None => selected[0].script_pubkey.clone(),
    };
    let mut outputs = request.outputs.clone();
    outputs.push(TxOutput::new(change_script, 0));
    let weight_with_change = estimate_weight(&input_types, &outputs);
    let fee_with_change = fee_for_weight(weight_with_change, request.fee_rate);

    let leftover = input_total
        .checked_sub(output_total)
        .and_then(|v| v.checked_sub(fee_with_change));

    let (fee, change_index, weight) = match leftover {
        Some(change) if change > request.dust_threshold => {
            let index = outputs.len() - 1;
            outputs[index].value = change;
            (fee_with_change, Some(index), weight_with_change)
        }
        _ => {
            outputs.pop();
            let weight = estimate_weight(&input_types, &outputs);
            (input_total.saturating_sub(output_total), None, weight)
        }
    };

    let tx = Transaction {
        version: TX_VERSION,
        lock_time: 0,
        inputs: selected.iter().map(|u| TxInput::unsigned(u.outpoint())).collect(),
        outputs,
    };

    Ok(Plan {
        unsigned: UnsignedTransaction::new(tx, selected)?,
        fee,
        change_index,
        weight,
    })
}

pub(crate) fn write_outpoint(buf: &mut Vec<u8>, outpoint: &OutPoint) -> Result<()> {
    buf.extend_from_slice(&outpoint.txid_bytes()?);
    buf.extend_from_slice(&outpoint.vout.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_script(tag: u8) -> Vec<u8> {
        let mut s = vec![0x76, 0xa9, 0x14];
        s.extend_from_slice(&[tag; 20]);
        s.extend_from_slice(&[0x88, 0xac]);
        s
    }

    fn p2wpkh_script(tag: u8) -> Vec<u8> {
        let mut s = vec![0x00, 0x14];
        s.extend_from_slice(&[tag; 20]);
        s
    }

    fn utxo(tag: u8, value: u64, script: Vec<u8>) -> Utxo {
        Utxo {
            txid: format!("{:02x}", tag).repeat(32),
            vout: 0,
            value,
            script_pubkey: script,
            confirmations: 6,
        }
    }

    #[test]
    fn test_single_p2pkh_weight() {
        let outputs = vec![TxOutput::new(p2pkh_script(2), 1), TxOutput::new(p2pkh_script(3), 1)];
        // 10 + 148 + 34 + 34
        assert_eq!(estimate_weight(&[ScriptType::P2pkh], &outputs), 226 * 4);
    }

    #[test]
    fn test_witness_marker_counted_once() {
        let outputs = vec![TxOutput::new(p2wpkh_script(2), 1)];
        let weight = estimate_weight(&[ScriptType::P2wpkh, ScriptType::P2wpkh], &outputs);
        assert_eq!(weight, 40 + 2 * ScriptType::P2wpkh.input_weight() + 31 * 4 + 2);
    }

    #[test]
    fn test_fee_rounds_up() {
        assert_eq!(fee_for_weight(230, 1.0), 58);
        assert_eq!(fee_for_weight(904, 2.0), 452);
        assert_eq!(fee_for_weight(904, 0.0), 0);
    }

    #[test]
    fn test_change_scenario_5m_in() {
        let request = BuildRequest::new(
            InputSource::Explicit(vec![utxo(1, 5_000_000, p2pkh_script(1))]),
            vec![TxOutput::new(p2pkh_script(9), 4_990_000)],
            2.0,
        );
        let built = build(BuilderBackend::Library, &request).unwrap();

        assert_eq!(built.fee, 452);
        assert_eq!(built.change_index, Some(1));
        assert_eq!(built.change_value(), Some(9_548));
        assert_eq!(built.unsigned.tx.outputs[1].script_pubkey, p2pkh_script(1));
        assert_eq!(built.estimated_vsize, 226);
    }

    #[test]
    fn test_dust_boundary() {
        let inputs = InputSource::Explicit(vec![utxo(1, 5_000_000, p2pkh_script(1))]);

        // leftover after the with-change fee (452) is exactly the threshold
        let at_dust = BuildRequest::new(inputs.clone(), vec![TxOutput::new(p2pkh_script(9), 4_999_002)], 2.0);
        let built = build(BuilderBackend::Reference, &at_dust).unwrap();
        assert_eq!(built.change_index, None);
        assert_eq!(built.fee, 998);
        assert_eq!(built.unsigned.tx.outputs.len(), 1);

        let above_dust = BuildRequest::new(inputs, vec![TxOutput::new(p2pkh_script(9), 4_999_001)], 2.0);
        let built = build(BuilderBackend::Reference, &above_dust).unwrap();
        assert_eq!(built.change_value(), Some(547));
        assert_eq!(built.fee, 452);
    }

    #[test]
    fn test_explicit_inputs_short_is_insufficient() {
        let request = BuildRequest::new(
            InputSource::Explicit(vec![utxo(1, 10_000, p2wpkh_script(1))]),
            vec![TxOutput::new(p2wpkh_script(2), 10_000)],
            1.0,
        );
        assert!(matches!(
            build(BuilderBackend::Library, &request),
            Err(WalletError::InsufficientFunds { available: 10_000, .. })
        ));
    }

    #[test]
    fn test_custom_change_script_and_threshold() {
        let request = BuildRequest::new(
            InputSource::Explicit(vec![utxo(1, 100_000, p2wpkh_script(1))]),
            vec![TxOutput::new(p2wpkh_script(2), 50_000)],
            1.0,
        )
        .with_change_script(p2wpkh_script(7))
        .with_dust_threshold(60_000);

        let built = build(BuilderBackend::Library, &request).unwrap();
        assert_eq!(built.change_index, None);
        assert_eq!(built.fee, 50_000);

        let request = request.with_dust_threshold(546);
        let built = build(BuilderBackend::Library, &request).unwrap();
        assert_eq!(built.unsigned.tx.outputs[1].script_pubkey, p2wpkh_script(7));
    }

    #[test]
    fn test_invalid_outputs_rejected() {
        let inputs = InputSource::Explicit(vec![utxo(1, 100_000, p2wpkh_script(1))]);
        let zero = BuildRequest::new(inputs.clone(), vec![TxOutput::new(p2wpkh_script(2), 0)], 1.0);
        assert!(matches!(
            build(BuilderBackend::Library, &zero),
            Err(WalletError::InvalidOutput { index: 0, .. })
        ));

        let none = BuildRequest::new(inputs.clone(), Vec::new(), 1.0);
        assert!(matches!(build(BuilderBackend::Library, &none), Err(WalletError::InvalidOutput { .. })));

        let bad_rate = BuildRequest::new(inputs, vec![TxOutput::new(p2wpkh_script(2), 1_000)], f64::NAN);
        assert!(matches!(build(BuilderBackend::Library, &bad_rate), Err(WalletError::InvalidFeeRate(_))));
    }

    #[test]
    fn test_explicit_outpoint_spent_twice_rejected() {
        let input = utxo(1, 100_000, p2wpkh_script(1));
        let request = BuildRequest::new(
            InputSource::Explicit(vec![input.clone(), input]),
            vec![TxOutput::new(p2wpkh_script(2), 150_000)],
            1.0,
        );
        for backend in BuilderBackend::ALL {
            assert!(matches!(build(backend, &request), Err(WalletError::InvalidInput { index: 1, .. })));
        }
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let pay = vec![TxOutput::new(p2wpkh_script(2), 10_000)];

        let huge_rate = BuildRequest::new(
            InputSource::Explicit(vec![utxo(1, 100_000, p2wpkh_script(1))]),
            pay.clone(),
            1e30,
        );
        assert!(matches!(
            build(BuilderBackend::Library, &huge_rate),
            Err(WalletError::InsufficientFunds { available: 100_000, required: u64::MAX })
        ));

        let over_cap = BuildRequest::new(
            InputSource::Explicit(vec![utxo(1, u64::MAX, p2wpkh_script(1)), utxo(2, 10, p2wpkh_script(2))]),
            pay,
            1.0,
        );
        assert!(matches!(
            build(BuilderBackend::Reference, &over_cap),
            Err(WalletError::InvalidInput { index: 0, .. })
        ));
    }

    #[test]
    fn test_backends_agree() {
        let request = BuildRequest::new(
            InputSource::Candidates(vec![
                utxo(1, 30_000, p2wpkh_script(1)),
                utxo(2, 80_000, p2pkh_script(2)),
                utxo(3, 20_000, p2wpkh_script(3)),
            ]),
            vec![TxOutput::new(p2wpkh_script(9), 95_000)],
            3.0,
        );
        let a = build(BuilderBackend::Library, &request).unwrap();
        let b = build(BuilderBackend::Reference, &request).unwrap();
        assert_eq!(a.raw_hex, b.raw_hex);
        assert_eq!(a.txid, b.txid);
        assert!(cross_check(&a.unsigned.tx).is_ok());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("REFERENCE".parse::<BuilderBackend>().unwrap(), BuilderBackend::Reference);
        assert_eq!(BuilderBackend::default(), BuilderBackend::Library);
        assert!("psbt".parse::<BuilderBackend>().is_err());
    }
}
