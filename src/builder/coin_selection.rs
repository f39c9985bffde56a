//! Coin selection for candidate UTXO sets
//!
//! Largest-first: candidates are sorted by value descending (ties by txid,
//! then vout) and taken until they cover the outputs plus the fee of the
//! inputs chosen so far. Repeated outpoints and values above the supply
//! cap are dropped before sorting.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::{Result, WalletError};
use crate::types::{sum_values, ScriptType, TxOutput, Utxo};

use super::fee_for;

/// Select from `candidates` to pay `outputs` at `fee_rate`.
///
/// Candidates whose locking script cannot be signed are skipped. Never
/// looks beyond `candidates`.
pub fn select_largest_first(candidates: &[Utxo], outputs: &[TxOutput], fee_rate: f64) -> Result<Vec<Utxo>> {
    let output_total = sum_values(outputs.iter().map(|o| o.value));

    let mut seen = HashSet::new();
    let mut sorted: Vec<(&Utxo, ScriptType)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, u)| {
            if let Err(e) = u.check_value(index) {
                debug!("Skipping candidate {}: {}", u.outpoint(), e);
                return None;
            }
            if !seen.insert(u.outpoint()) {
                debug!("Skipping repeated candidate {}", u.outpoint());
                return None;
            }
            match u.script_type() {
                Ok(t) => Some((u, t)),
                Err(e) => {
                    debug!("Skipping candidate {}: {}", u.outpoint(), e);
                    None
                }
            }
        })
        .collect();
    sorted.sort_by(|(a, _), (b, _)| {
        b.value
            .cmp(&a.value)
            .then_with(|| a.txid.cmp(&b.txid))
            .then_with(|| a.vout.cmp(&b.vout))
    });

    let mut selected = Vec::new();
    let mut types = Vec::new();
    let mut total = 0u64;
    let mut required = output_total.saturating_add(fee_for(&types, outputs, fee_rate));

    for (utxo, script_type) in sorted {
        selected.push(utxo.clone());
        types.push(script_type);
        total = total.saturating_add(utxo.value);

        // Fee grows with every input
        required = output_total.saturating_add(fee_for(&types, outputs, fee_rate));
        if total >= required {
            info!("✅ Selected {} of {} UTXOs contributing {} sats", selected.len(), candidates.len(), total);
            return Ok(selected);
        }
    }

    Err(WalletError::InsufficientFunds { available: total, required })
}
