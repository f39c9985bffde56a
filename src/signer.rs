//! Per-input signing for P2PKH, nested P2SH-P2WPKH, P2WPKH and P2TR key path
//!
//! Signing is pure: it reads the unsigned transaction and its prevouts and
//! returns the input with its proof attached. Signatures are deterministic
//! (RFC6979 ECDSA, BIP340 Schnorr without auxiliary randomness), so signing
//! the same input twice yields identical bytes.

use bdk_wallet::bitcoin::{
    self,
    ecdsa,
    hashes::Hash,
    key::TapTweak,
    script::{Builder, PushBytesBuf},
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    taproot, Amount, Script, TxOut, Witness,
};

use crate::builder::library::to_bitcoin;
use crate::error::{Result, WalletError};
use crate::keys::{redeem_script_for, script_pubkey_for, KeyMaterial};
use crate::types::{ScriptType, SignedTransaction, TxInput, UnsignedTransaction, Utxo};

/// Sign input `index` of `unsigned` as `script_type` with `key`
pub fn sign(
    unsigned: &UnsignedTransaction,
    index: usize,
    key: &KeyMaterial,
    script_type: ScriptType,
) -> Result<TxInput> {
    let count = unsigned.tx.inputs.len();
    let (mut input, prevout) = match (unsigned.tx.inputs.get(index), unsigned.prevouts.get(index)) {
        (Some(input), Some(prevout)) => (input.clone(), prevout),
        _ => return Err(WalletError::InvalidInputIndex { index, count }),
    };

    ScriptType::classify(&prevout.script_pubkey)?;
    if script_pubkey_for(key, script_type).as_bytes() != prevout.script_pubkey.as_slice() {
        return Err(WalletError::KeyMismatch { index, script_type });
    }

    let btc_tx = to_bitcoin(&unsigned.tx)?;
    let spent = prevout_txouts(&unsigned.prevouts);
    let mut cache = SighashCache::new(&btc_tx);
    let secp = Secp256k1::new();

    match script_type {
        ScriptType::P2pkh => {
            let msg = signature_message(&mut cache, index, &spent, script_type, &prevout_script(prevout), None)?;
            let sig = ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, key.secret_key()));
            let pubkey = bitcoin::PublicKey::new(key.public_key());
            input.script_sig = Builder::new()
                .push_slice(sig.serialize())
                .push_key(&pubkey)
                .into_script()
                .into_bytes();
            input.witness.clear();
        }
        ScriptType::P2sh => {
            let redeem = redeem_script_for(key);
            let msg = signature_message(&mut cache, index, &spent, script_type, &redeem, None)?;
            let sig = ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, key.secret_key()));
            let push = PushBytesBuf::try_from(redeem.into_bytes())
                .map_err(|e| WalletError::Signing(e.to_string()))?;
            input.script_sig = Builder::new().push_slice(push).into_script().into_bytes();
            input.witness = Witness::p2wpkh(&sig, &key.public_key()).to_vec();
        }
        ScriptType::P2wpkh => {
            let msg = signature_message(&mut cache, index, &spent, script_type, &prevout_script(prevout), None)?;
            let sig = ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, key.secret_key()));
            input.script_sig.clear();
            input.witness = Witness::p2wpkh(&sig, &key.public_key()).to_vec();
        }
        ScriptType::P2tr => {
            let msg = signature_message(
                &mut cache,
                index,
                &spent,
                script_type,
                &prevout_script(prevout),
                Some(TapSighashType::Default),
            )?;
            let tweaked = key.keypair().tap_tweak(&secp, None).to_inner();
            let signature = secp.sign_schnorr_no_aux_rand(&msg, &tweaked);
            let sig = taproot::Signature { signature, sighash_type: TapSighashType::Default };
            input.script_sig.clear();
            input.witness = vec![sig.to_vec()];
        }
    }

    tracing::debug!("✍️  Signed input {} ({})", index, script_type);
    Ok(input)
}

/// Sign every input with `key`, classifying each prevout's script
pub fn sign_all(unsigned: &UnsignedTransaction, key: &KeyMaterial) -> Result<SignedTransaction> {
    sign_with_keys(unsigned, std::slice::from_ref(key))
}

/// Sign every input with whichever of `keys` controls its prevout
pub fn sign_with_keys(unsigned: &UnsignedTransaction, keys: &[KeyMaterial]) -> Result<SignedTransaction> {
    let mut tx = unsigned.tx.clone();

    for (index, prevout) in unsigned.prevouts.iter().enumerate() {
        let script_type = prevout.script_type()?;
        let key = keys
            .iter()
            .find(|k| script_pubkey_for(k, script_type).as_bytes() == prevout.script_pubkey.as_slice())
            .ok_or(WalletError::KeyMismatch { index, script_type })?;
        tx.inputs[index] = sign(unsigned, index, key, script_type)?;
    }

    tracing::info!("✍️  Signed all {} inputs", tx.inputs.len());
    Ok(SignedTransaction { tx, prevouts: unsigned.prevouts.clone() })
}

/// Spent outputs in input order, for sighashes that commit to all of them
pub(crate) fn prevout_txouts(prevouts: &[Utxo]) -> Vec<TxOut> {
    prevouts
        .iter()
        .map(|u| TxOut {
            value: Amount::from_sat(u.value),
            script_pubkey: bitcoin::ScriptBuf::from_bytes(u.script_pubkey.clone()),
        })
        .collect()
}

fn prevout_script(prevout: &Utxo) -> bitcoin::ScriptBuf {
    bitcoin::ScriptBuf::from_bytes(prevout.script_pubkey.clone())
}

/// Message a signature on input `index` commits to.
///
/// `script` is the previous locking script for P2PKH and P2WPKH and the
/// redeem (P2WPKH) script for nested P2SH. `tap_sighash` is only read for
/// P2TR.
pub(crate) fn signature_message(
    cache: &mut SighashCache<&bitcoin::Transaction>,
    index: usize,
    spent: &[TxOut],
    script_type: ScriptType,
    script: &Script,
    tap_sighash: Option<TapSighashType>,
) -> Result<Message> {
    let signing = |e: String| WalletError::Signing(format!("sighash for input {}: {}", index, e));
    let digest = match script_type {
        ScriptType::P2pkh => cache
            .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
            .map_err(|e| signing(e.to_string()))?
            .to_byte_array(),
        ScriptType::P2sh | ScriptType::P2wpkh => {
            let value = spent.get(index).map(|o| o.value).ok_or_else(|| signing("missing prevout".into()))?;
            cache
                .p2wpkh_signature_hash(index, script, value, EcdsaSighashType::All)
                .map_err(|e| signing(e.to_string()))?
                .to_byte_array()
        }
        ScriptType::P2tr => cache
            .taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(spent),
                tap_sighash.unwrap_or(TapSighashType::Default),
            )
            .map_err(|e| signing(e.to_string()))?
            .to_byte_array(),
    };
    Ok(Message::from_digest(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Network;
    use crate::types::{Transaction, TxOutput, TX_VERSION};

    fn key(byte: u8) -> KeyMaterial {
        KeyMaterial::from_hex(&format!("{:02x}", byte).repeat(32), Network::Testnet).unwrap()
    }

    fn unsigned_for(key: &KeyMaterial, script_types: &[ScriptType]) -> UnsignedTransaction {
        let prevouts: Vec<Utxo> = script_types
            .iter()
            .enumerate()
            .map(|(i, t)| Utxo {
                txid: format!("{:02x}", i + 1).repeat(32),
                vout: i as u32,
                value: 100_000,
                script_pubkey: script_pubkey_for(key, *t).to_bytes(),
                confirmations: 3,
            })
            .collect();
        let tx = Transaction {
            version: TX_VERSION,
            lock_time: 0,
            inputs: prevouts.iter().map(|u| TxInput::unsigned(u.outpoint())).collect(),
            outputs: vec![TxOutput::new(vec![0x00, 0x14, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9], 90_000)],
        };
        UnsignedTransaction::new(tx, prevouts).unwrap()
    }

    #[test]
    fn test_proof_shapes_per_type() {
        let k = key(3);
        let unsigned = unsigned_for(&k, &ScriptType::ALL);

        let p2pkh = sign(&unsigned, 0, &k, ScriptType::P2pkh).unwrap();
        assert!(p2pkh.witness.is_empty());
        assert_eq!(*p2pkh.script_sig.last().unwrap(), k.public_key().serialize()[32]);

        let p2sh = sign(&unsigned, 1, &k, ScriptType::P2sh).unwrap();
        assert_eq!(p2sh.script_sig[0], 22);
        assert_eq!(&p2sh.script_sig[1..], redeem_script_for(&k).as_bytes());
        assert_eq!(p2sh.witness.len(), 2);

        let p2wpkh = sign(&unsigned, 2, &k, ScriptType::P2wpkh).unwrap();
        assert!(p2wpkh.script_sig.is_empty());
        assert_eq!(p2wpkh.witness[1], k.public_key().serialize().to_vec());
        assert_eq!(*p2wpkh.witness[0].last().unwrap(), 0x01);

        let p2tr = sign(&unsigned, 3, &k, ScriptType::P2tr).unwrap();
        assert_eq!(p2tr.witness.len(), 1);
        assert_eq!(p2tr.witness[0].len(), 64);
    }

    #[test]
    fn test_signatures_are_deterministic() {
        let k = key(5);
        let unsigned = unsigned_for(&k, &[ScriptType::P2wpkh, ScriptType::P2tr]);
        assert_eq!(sign_all(&unsigned, &k).unwrap(), sign_all(&unsigned, &k).unwrap());
    }

    #[test]
    fn test_wrong_type_is_key_mismatch() {
        let k = key(7);
        let unsigned = unsigned_for(&k, &[ScriptType::P2wpkh]);
        assert!(matches!(
            sign(&unsigned, 0, &k, ScriptType::P2tr),
            Err(WalletError::KeyMismatch { index: 0, script_type: ScriptType::P2tr })
        ));
    }

    #[test]
    fn test_wrong_key_is_key_mismatch() {
        let unsigned = unsigned_for(&key(7), &[ScriptType::P2pkh]);
        assert!(matches!(
            sign(&unsigned, 0, &key(8), ScriptType::P2pkh),
            Err(WalletError::KeyMismatch { .. })
        ));
        assert!(matches!(sign_all(&unsigned, &key(8)), Err(WalletError::KeyMismatch { .. })));
    }

    #[test]
    fn test_index_out_of_range() {
        let k = key(2);
        let unsigned = unsigned_for(&k, &[ScriptType::P2wpkh]);
        assert!(matches!(
            sign(&unsigned, 4, &k, ScriptType::P2wpkh),
            Err(WalletError::InvalidInputIndex { index: 4, count: 1 })
        ));
    }

    #[test]
    fn test_unrecognised_prevout_script() {
        let k = key(2);
        let mut unsigned = unsigned_for(&k, &[ScriptType::P2wpkh]);
        unsigned.prevouts[0].script_pubkey = vec![0x00, 0x20].into_iter().chain([1u8; 32]).collect();
        assert!(matches!(
            sign(&unsigned, 0, &k, ScriptType::P2wpkh),
            Err(WalletError::UnsupportedScriptType(_))
        ));
    }

    #[test]
    fn test_multi_key_signing_picks_matching_key() {
        let (a, b) = (key(10), key(11));
        let mut unsigned = unsigned_for(&a, &[ScriptType::P2wpkh, ScriptType::P2wpkh]);
        unsigned.prevouts[1].script_pubkey = script_pubkey_for(&b, ScriptType::P2tr).to_bytes();

        let signed = sign_with_keys(&unsigned, &[a, b]).unwrap();
        assert!(signed.tx.is_fully_signed());
        assert_eq!(signed.tx.inputs[1].witness[0].len(), 64);
    }
}
