//! Key material, key generation and address encoding
//!
//! Keys live only for the duration of a call: [`KeyMaterial`] has no
//! `Serialize` impl, its `Debug` output is redacted, and the secret is
//! erased on drop.

use std::fmt;
use std::str::FromStr;

use bdk_wallet::bitcoin::{
    bip32::{DerivationPath, Xpriv},
    hashes::Hash,
    key::{CompressedPublicKey, TapTweak, UntweakedPublicKey},
    secp256k1::{Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey},
    Address, NetworkKind, PrivateKey, ScriptBuf, ScriptHash,
};
use bdk_wallet::keys::{
    bip39::{Language, Mnemonic, WordCount},
    GeneratableKey, GeneratedKey,
};
use bdk_wallet::miniscript::Tap;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::config::Network;
use crate::error::{Result, WalletError};
use crate::types::ScriptType;

/// Derivation path used for BIP39 keys when none is given
pub const DEFAULT_BIP39_PATH: &str = "m/0";

/// A single signing key with its public half
pub struct KeyMaterial {
    secret: SecretKey,
    public: PublicKey,
    derivation_path: Option<String>,
    network: Network,
}

impl KeyMaterial {
    pub fn from_secret_key(secret: SecretKey, network: Network) -> Self {
        let secp = Secp256k1::signing_only();
        Self {
            public: secret.public_key(&secp),
            secret,
            derivation_path: None,
            network,
        }
    }

    /// Import a raw 32-byte secret given as hex
    pub fn from_hex(secret_hex: &str, network: Network) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(secret_hex.trim()).map_err(|e| WalletError::InvalidKey(format!("bad hex: {}", e)))?,
        );
        let secret = SecretKey::from_slice(&bytes).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret_key(secret, network))
    }

    /// Import a WIF key; it must encode a compressed key for `network`
    pub fn from_wif(wif: &str, network: Network) -> Result<Self> {
        let key = PrivateKey::from_wif(wif.trim()).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        if !key.compressed {
            return Err(WalletError::InvalidKey("uncompressed WIF keys are not supported".into()));
        }
        if key.network != NetworkKind::from(network.to_bdk_network()) {
            return Err(WalletError::InvalidKey(format!("WIF key is not for {}", network)));
        }
        Ok(Self::from_secret_key(key.inner, network))
    }

    /// Export as compressed WIF
    pub fn to_wif(&self) -> Zeroizing<String> {
        Zeroizing::new(PrivateKey::new(self.secret, self.network.to_bdk_network()).to_wif())
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn compressed_public_key(&self) -> CompressedPublicKey {
        CompressedPublicKey(self.public)
    }

    /// BIP86 internal key (x-only, untweaked)
    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.public.x_only_public_key().0
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from_secret_key(&Secp256k1::signing_only(), &self.secret)
    }

    pub fn derivation_path(&self) -> Option<&str> {
        self.derivation_path.as_deref()
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public", &self.public)
            .field("derivation_path", &self.derivation_path)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

/// How a new key is produced
#[derive(Debug, Clone)]
pub enum KeyGenMethod {
    /// 32 random bytes
    Entropy,
    /// Key at `m/0` of a BIP39 seed; a new 12-word mnemonic when `mnemonic` is None
    Bip39 { mnemonic: Option<String> },
    /// Key at an explicit BIP32 path of a BIP39 seed
    Bip32 { mnemonic: Option<String>, path: String },
}

/// Result of [`generate_key`]. The mnemonic is returned only when one was
/// involved, so the caller can back it up.
#[derive(Debug)]
pub struct GeneratedKeyMaterial {
    pub key: KeyMaterial,
    pub mnemonic: Option<Zeroizing<String>>,
}

pub fn generate_key(method: KeyGenMethod, network: Network) -> Result<GeneratedKeyMaterial> {
    match method {
        KeyGenMethod::Entropy => {
            let mut bytes = Zeroizing::new([0u8; 32]);
            // A uniformly random 32-byte string is a valid scalar with
            // overwhelming probability; retry the rare miss.
            let secret = loop {
                rand::thread_rng().fill_bytes(&mut bytes[..]);
                if let Ok(secret) = SecretKey::from_slice(&bytes[..]) {
                    break secret;
                }
            };
            tracing::info!("🔑 Generated key from fresh entropy");
            Ok(GeneratedKeyMaterial { key: KeyMaterial::from_secret_key(secret, network), mnemonic: None })
        }
        KeyGenMethod::Bip39 { mnemonic } => derive_from_mnemonic(mnemonic, DEFAULT_BIP39_PATH, network),
        KeyGenMethod::Bip32 { mnemonic, path } => derive_from_mnemonic(mnemonic, &path, network),
    }
}

fn derive_from_mnemonic(phrase: Option<String>, path: &str, network: Network) -> Result<GeneratedKeyMaterial> {
    let phrase = Zeroizing::new(phrase.map(|p| p.trim().to_string()));
    let mnemonic = match phrase.as_deref() {
        Some(p) => Mnemonic::parse_in(Language::English, p).map_err(|e| WalletError::InvalidKey(e.to_string()))?,
        None => {
            let gen: GeneratedKey<_, Tap> = Mnemonic::generate((WordCount::Words12, Language::English))
                .map_err(|_| WalletError::InvalidKey("mnemonic generation failed".into()))?;
            let words = Zeroizing::new(gen.to_string());
            tracing::info!("🔑 Generated new 12-word mnemonic");
            Mnemonic::parse_in(Language::English, words.as_str())
                .map_err(|e| WalletError::InvalidKey(e.to_string()))?
        }
    };

    let path_str = path.trim();
    let path = DerivationPath::from_str(path_str)
        .map_err(|e| WalletError::InvalidKey(format!("bad derivation path {}: {}", path_str, e)))?;

    let seed = Zeroizing::new(mnemonic.to_seed(""));
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network.to_bdk_network(), &seed[..])
        .map_err(|e| WalletError::InvalidKey(e.to_string()))?;
    let derived = master
        .derive_priv(&secp, &path)
        .map_err(|e| WalletError::InvalidKey(e.to_string()))?;

    let mut key = KeyMaterial::from_secret_key(derived.private_key, network);
    key.derivation_path = Some(path_str.to_string());

    Ok(GeneratedKeyMaterial {
        key,
        mnemonic: Some(Zeroizing::new(mnemonic.to_string())),
    })
}

/// P2WPKH program that nested SegWit wraps in P2SH
pub fn redeem_script_for(key: &KeyMaterial) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&key.compressed_public_key().wpubkey_hash())
}

/// Locking script `key` controls under `script_type`
pub fn script_pubkey_for(key: &KeyMaterial, script_type: ScriptType) -> ScriptBuf {
    let pk = key.compressed_public_key();
    match script_type {
        ScriptType::P2pkh => ScriptBuf::new_p2pkh(&pk.pubkey_hash()),
        ScriptType::P2sh => {
            let redeem = redeem_script_for(key);
            ScriptBuf::new_p2sh(&ScriptHash::hash(redeem.as_bytes()))
        }
        ScriptType::P2wpkh => ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()),
        ScriptType::P2tr => {
            let secp = Secp256k1::verification_only();
            ScriptBuf::new_p2tr(&secp, key.x_only_public_key(), None)
        }
    }
}

/// BIP86 output key for a taproot internal key
pub fn taproot_output_key(internal: UntweakedPublicKey) -> XOnlyPublicKey {
    let secp = Secp256k1::verification_only();
    internal.tap_tweak(&secp, None).0.to_inner()
}

/// Encode the address `key` controls under `script_type`
pub fn address_for(key: &KeyMaterial, script_type: ScriptType, network: Network) -> Result<String> {
    script_to_address(script_pubkey_for(key, script_type).as_bytes(), network)
}

pub fn script_to_address(script_pubkey: &[u8], network: Network) -> Result<String> {
    let script = ScriptBuf::from_bytes(script_pubkey.to_vec());
    Address::from_script(&script, network.to_bdk_network())
        .map(|a| a.to_string())
        .map_err(|e| WalletError::InvalidAddress {
            address: hex::encode(script_pubkey),
            reason: e.to_string(),
        })
}

/// Locking script for `address`, which must belong to `network`
pub fn address_to_script(address: &str, network: Network) -> Result<Vec<u8>> {
    let invalid = |reason: String| WalletError::InvalidAddress { address: address.to_string(), reason };
    let parsed = Address::from_str(address.trim()).map_err(|e| invalid(e.to_string()))?;
    let checked = parsed
        .require_network(network.to_bdk_network())
        .map_err(|e| invalid(e.to_string()))?;
    Ok(checked.script_pubkey().to_bytes())
}
