//! Transaction validation against caller-supplied prevouts
//!
//! Checks run in order and stop at the first structural failure:
//! decoding, non-empty inputs and outputs with no outpoint spent twice,
//! output value range, and value conservation. Those return typed errors. Proof checks run only when some
//! input carries a proof; their failures are collected in the report.

use std::collections::HashMap;

use bdk_wallet::bitcoin::{
    self, ecdsa,
    key::CompressedPublicKey,
    script::Instruction,
    secp256k1::{PublicKey, Secp256k1, XOnlyPublicKey},
    sighash::{EcdsaSighashType, SighashCache},
    taproot, ScriptBuf, ScriptHash,
};
use bdk_wallet::bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};

use crate::builder::library::to_bitcoin;
use crate::builder::BuilderBackend;
use crate::error::{Result, WalletError};
use crate::signer::{prevout_txouts, signature_message};
use crate::types::{check_distinct_outpoints, sum_values, OutPoint, ScriptType, Transaction, TxInput, Utxo};

/// What the validator is allowed to know besides the raw bytes
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// UTXOs spent by the transaction, in any order
    pub prevouts: Vec<Utxo>,
    pub backend: BuilderBackend,
}

impl ValidationContext {
    pub fn new(prevouts: Vec<Utxo>, backend: BuilderBackend) -> Self {
        Self { prevouts, backend }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// None for transaction-level issues
    pub input_index: Option<usize>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub txid: String,
    pub is_valid: bool,
    /// Whether any input carries a proof
    pub is_signed: bool,
    pub input_count: usize,
    pub output_count: usize,
    pub input_total: u64,
    pub output_total: u64,
    pub fee: u64,
    pub weight: u64,
    pub vsize: u64,
    pub fee_rate_sat_per_vbyte: f64,
    pub issues: Vec<ValidationIssue>,
}

/// Validate `raw_tx_hex` without modifying it
pub fn validate(raw_tx_hex: &str, context: &ValidationContext) -> Result<ValidationReport> {
    let builder = context.backend.builder();

    // (a) decode
    let raw = hex::decode(raw_tx_hex.trim())?;
    let tx = builder.decode(&raw)?;

    // (b) shape
    if tx.inputs.is_empty() {
        return Err(WalletError::MalformedTransaction("transaction has no inputs".into()));
    }
    if tx.outputs.is_empty() {
        return Err(WalletError::MalformedTransaction("transaction has no outputs".into()));
    }

    check_distinct_outpoints(tx.inputs.iter().map(|i| &i.previous_output))?;

    // (c) output values
    for (index, output) in tx.outputs.iter().enumerate() {
        output.check_value(index)?;
    }

    // (d) value conservation
    let prevouts = resolve_prevouts(&tx, &context.prevouts)?;
    for (index, prevout) in prevouts.iter().enumerate() {
        prevout.check_value(index)?;
    }
    let input_total = sum_values(prevouts.iter().map(|u| u.value));
    let output_total = tx.output_total();
    let fee = input_total
        .checked_sub(output_total)
        .ok_or(WalletError::NegativeFee { inputs: input_total, outputs: output_total })?;

    let weight = transaction_weight(&tx, raw.len(), context.backend)?;
    let vsize = weight.div_ceil(4);
    let txid = builder.txid(&tx)?;

    // (e) proofs
    let is_signed = tx.has_any_proof();
    let issues = if is_signed { verify_proofs(&tx, &prevouts)? } else { Vec::new() };
    for issue in &issues {
        tracing::warn!("⚠️  {}: input {:?}: {}", txid, issue.input_index, issue.message);
    }

    let report = ValidationReport {
        txid,
        is_valid: issues.is_empty(),
        is_signed,
        input_count: tx.inputs.len(),
        output_count: tx.outputs.len(),
        input_total,
        output_total,
        fee,
        weight,
        vsize,
        fee_rate_sat_per_vbyte: fee as f64 / vsize as f64,
        issues,
    };

    tracing::debug!(
        "🔍 Validated {}: valid={}, signed={}, fee {} sats ({:.2} sat/vB)",
        report.txid,
        report.is_valid,
        report.is_signed,
        report.fee,
        report.fee_rate_sat_per_vbyte
    );
    Ok(report)
}

/// Prevouts in input order
fn resolve_prevouts(tx: &Transaction, supplied: &[Utxo]) -> Result<Vec<Utxo>> {
    let by_outpoint: HashMap<OutPoint, &Utxo> = supplied.iter().map(|u| (u.outpoint(), u)).collect();
    tx.inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            by_outpoint
                .get(&input.previous_output)
                .map(|u| (*u).clone())
                .ok_or_else(|| WalletError::UnknownPrevout {
                    index,
                    txid: input.previous_output.txid.clone(),
                    vout: input.previous_output.vout,
                })
        })
        .collect()
}

/// BIP141 weight: base size × 3 + total size
fn transaction_weight(tx: &Transaction, total_size: usize, backend: BuilderBackend) -> Result<u64> {
    if !tx.has_witness() {
        return Ok(total_size as u64 * 4);
    }
    let mut stripped = tx.clone();
    for input in stripped.inputs.iter_mut() {
        input.witness.clear();
    }
    let base_size = backend.builder().encode(&stripped)?.len();
    Ok(base_size as u64 * 3 + total_size as u64)
}

fn verify_proofs(tx: &Transaction, prevouts: &[Utxo]) -> Result<Vec<ValidationIssue>> {
    let btc_tx = to_bitcoin(tx)?;
    let spent = prevout_txouts(prevouts);
    let mut cache = SighashCache::new(&btc_tx);

    let mut issues = Vec::new();
    for (index, (input, prevout)) in tx.inputs.iter().zip(prevouts).enumerate() {
        if let Err(message) = verify_input(&mut cache, index, input, prevout, &spent) {
            issues.push(ValidationIssue { input_index: Some(index), message });
        }
    }
    Ok(issues)
}

type Check = std::result::Result<(), String>;

fn verify_input(
    cache: &mut SighashCache<&bitcoin::Transaction>,
    index: usize,
    input: &TxInput,
    prevout: &Utxo,
    spent: &[bitcoin::TxOut],
) -> Check {
    if !input.has_proof() {
        return Err("missing signature".into());
    }
    let script_type = ScriptType::classify(&prevout.script_pubkey).map_err(|e| e.to_string())?;
    let locking = ScriptBuf::from_bytes(prevout.script_pubkey.clone());
    let secp = Secp256k1::verification_only();

    match script_type {
        ScriptType::P2pkh => {
            let pushes = pushes(&input.script_sig)?;
            let [sig, pubkey] = pushes.as_slice() else {
                return Err(format!("expected <sig> <pubkey> scriptSig, found {} pushes", pushes.len()));
            };
            let pubkey = parse_pubkey(pubkey)?;
            if ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(pubkey).pubkey_hash()) != locking {
                return Err("public key does not match locking script".into());
            }
            let msg = signature_message(cache, index, spent, script_type, &locking, None).map_err(|e| e.to_string())?;
            let sig = parse_ecdsa(sig)?;
            secp.verify_ecdsa(&msg, &sig.signature, &pubkey)
                .map_err(|_| "signature does not verify".to_string())
        }
        ScriptType::P2sh => {
            let pushes = pushes(&input.script_sig)?;
            let [redeem] = pushes.as_slice() else {
                return Err("expected a single redeem script push".into());
            };
            if ScriptBuf::new_p2sh(&ScriptHash::hash(redeem)) != locking {
                return Err("redeem script does not match locking script".into());
            }
            let redeem = ScriptBuf::from_bytes(redeem.clone());
            if !redeem.is_p2wpkh() {
                return Err("only P2SH-wrapped P2WPKH is supported".into());
            }
            verify_p2wpkh_witness(cache, index, input, &redeem, spent, script_type)
        }
        ScriptType::P2wpkh => {
            if !input.script_sig.is_empty() {
                return Err("native SegWit input has a scriptSig".into());
            }
            verify_p2wpkh_witness(cache, index, input, &locking, spent, script_type)
        }
        ScriptType::P2tr => {
            let [sig] = input.witness.as_slice() else {
                return Err(format!("expected one witness item, found {}", input.witness.len()));
            };
            let sig = taproot::Signature::from_slice(sig).map_err(|e| format!("bad Schnorr signature: {}", e))?;
            let output_key = XOnlyPublicKey::from_slice(&prevout.script_pubkey[2..])
                .map_err(|e| format!("bad output key: {}", e))?;
            let msg = signature_message(cache, index, spent, script_type, &locking, Some(sig.sighash_type))
                .map_err(|e| e.to_string())?;
            secp.verify_schnorr(&sig.signature, &msg, &output_key)
                .map_err(|_| "signature does not verify".to_string())
        }
    }
}

/// Witness `[sig, pubkey]` against a P2WPKH program
fn verify_p2wpkh_witness(
    cache: &mut SighashCache<&bitcoin::Transaction>,
    index: usize,
    input: &TxInput,
    program: &ScriptBuf,
    spent: &[bitcoin::TxOut],
    script_type: ScriptType,
) -> Check {
    let [sig, pubkey] = input.witness.as_slice() else {
        return Err(format!("expected [sig, pubkey] witness, found {} items", input.witness.len()));
    };
    let pubkey = parse_pubkey(pubkey)?;
    if ScriptBuf::new_p2wpkh(&CompressedPublicKey(pubkey).wpubkey_hash()) != *program {
        return Err("public key does not match witness program".into());
    }
    let msg = signature_message(cache, index, spent, script_type, program, None).map_err(|e| e.to_string())?;
    let sig = parse_ecdsa(sig)?;
    Secp256k1::verification_only()
        .verify_ecdsa(&msg, &sig.signature, &pubkey)
        .map_err(|_| "signature does not verify".to_string())
}

fn pushes(script_sig: &[u8]) -> std::result::Result<Vec<Vec<u8>>, String> {
    bitcoin::Script::from_bytes(script_sig)
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes().to_vec()),
            Ok(Instruction::Op(op)) => Err(format!("unexpected opcode {} in scriptSig", op)),
            Err(e) => Err(format!("unparseable scriptSig: {}", e)),
        })
        .collect()
}

fn parse_pubkey(bytes: &[u8]) -> std::result::Result<PublicKey, String> {
    if bytes.len() != 33 {
        return Err("public key must be compressed".into());
    }
    PublicKey::from_slice(bytes).map_err(|e| format!("bad public key: {}", e))
}

fn parse_ecdsa(bytes: &[u8]) -> std::result::Result<ecdsa::Signature, String> {
    let sig = ecdsa::Signature::from_slice(bytes).map_err(|e| format!("bad ECDSA signature: {}", e))?;
    if sig.sighash_type != EcdsaSighashType::All {
        return Err(format!("unsupported sighash type {}", sig.sighash_type));
    }
    Ok(sig)
}
