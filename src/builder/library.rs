//! Backend built on the `bitcoin` crate's consensus encoding

use std::str::FromStr;

use bdk_wallet::bitcoin::{
    self, absolute::LockTime, consensus::encode, transaction::Version, Amount, ScriptBuf, Sequence, TxIn,
    TxOut, Txid, Witness,
};

use crate::error::{Result, WalletError};
use crate::types::{OutPoint, Transaction, TxInput, TxOutput};

use super::{BuilderBackend, TransactionBuilder};

#[derive(Debug, Clone, Copy, Default)]
pub struct LibraryBuilder;

impl TransactionBuilder for LibraryBuilder {
    fn backend(&self) -> BuilderBackend {
        BuilderBackend::Library
    }

    fn encode(&self, tx: &Transaction) -> Result<Vec<u8>> {
        Ok(encode::serialize(&to_bitcoin(tx)?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Transaction> {
        let tx: bitcoin::Transaction =
            encode::deserialize(bytes).map_err(|e| WalletError::MalformedTransaction(e.to_string()))?;
        Ok(from_bitcoin(&tx))
    }

    fn txid(&self, tx: &Transaction) -> Result<String> {
        Ok(to_bitcoin(tx)?.compute_txid().to_string())
    }
}

/// Convert to the `bitcoin` crate's transaction type
pub fn to_bitcoin(tx: &Transaction) -> Result<bitcoin::Transaction> {
    let input = tx
        .inputs
        .iter()
        .map(|i| {
            let txid = Txid::from_str(&i.previous_output.txid).map_err(|e| {
                WalletError::MalformedTransaction(format!("bad txid {}: {}", i.previous_output.txid, e))
            })?;
            Ok(TxIn {
                previous_output: bitcoin::OutPoint { txid, vout: i.previous_output.vout },
                script_sig: ScriptBuf::from_bytes(i.script_sig.clone()),
                sequence: Sequence(i.sequence),
                witness: Witness::from_slice(&i.witness),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let output = tx
        .outputs
        .iter()
        .map(|o| TxOut {
            value: Amount::from_sat(o.value),
            script_pubkey: ScriptBuf::from_bytes(o.script_pubkey.clone()),
        })
        .collect();

    Ok(bitcoin::Transaction {
        version: Version(tx.version),
        lock_time: LockTime::from_consensus(tx.lock_time),
        input,
        output,
    })
}

pub fn from_bitcoin(tx: &bitcoin::Transaction) -> Transaction {
    Transaction {
        version: tx.version.0,
        lock_time: tx.lock_time.to_consensus_u32(),
        inputs: tx
            .input
            .iter()
            .map(|i| TxInput {
                previous_output: OutPoint::new(i.previous_output.txid.to_string(), i.previous_output.vout),
                script_sig: i.script_sig.to_bytes(),
                sequence: i.sequence.0,
                witness: i.witness.to_vec(),
            })
            .collect(),
        outputs: tx
            .output
            .iter()
            .map(|o| TxOutput::new(o.script_pubkey.to_bytes(), o.value.to_sat()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Genesis coinbase
    const GENESIS_TX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";
    const GENESIS_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    #[test]
    fn test_decode_genesis_coinbase() {
        let bytes = hex::decode(GENESIS_TX).unwrap();
        let tx = LibraryBuilder.decode(&bytes).unwrap();

        assert_eq!(tx.version, 1);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 50 * 100_000_000);
        assert_eq!(LibraryBuilder.txid(&tx).unwrap(), GENESIS_TXID);
        assert_eq!(LibraryBuilder.encode(&tx).unwrap(), bytes);
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            LibraryBuilder.decode(&[0x02, 0x00, 0x00]),
            Err(WalletError::MalformedTransaction(_))
        ));
    }
}
