//! Command-line interface for coldwallet
//!
//! One subcommand per engine operation. Everything the engine returns is
//! printed for a human; `--json` switches reports to JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::broadcast::TrackOptions;
use crate::builder::BuilderBackend;
use crate::config::{Config, Network};
use crate::engine::{FeeChoice, SendRequest, WalletEngine};
use crate::keys::{address_for, generate_key, KeyGenMethod, KeyMaterial};
use crate::types::{FeeSource, Freshness, Priority, ScriptType, TxOutput, Utxo};

#[derive(Parser, Debug)]
#[command(name = "coldwallet", author, version, about)]
pub struct Args {
    /// Network (mainnet, testnet, signet, regtest); overrides the config file
    #[arg(short, long, global = true)]
    pub network: Option<Network>,

    /// Never contact the provider; serve cached data only
    #[arg(long, global = true)]
    pub offline: bool,

    /// Builder backend (library, reference); overrides the config file
    #[arg(long, global = true)]
    pub backend: Option<BuilderBackend>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fee rates for every priority
    Fees,
    /// Balance of an address
    Balance { address: String },
    /// UTXO set of an address
    Utxos { address: String },
    /// Generate a key and show its addresses
    Keygen {
        #[arg(long, value_enum, default_value_t = KeygenKind::Bip39)]
        method: KeygenKind,
        /// Restore from this mnemonic instead of generating one
        #[arg(long)]
        mnemonic: Option<String>,
        /// Derivation path for --method bip32
        #[arg(long, default_value = "m/84'/0'/0'/0/0")]
        path: String,
    },
    /// Address a WIF key controls
    Address {
        #[arg(long)]
        wif: String,
        #[arg(long = "type", default_value = "p2wpkh")]
        script_type: ScriptType,
    },
    /// Build, sign and validate a payment; broadcast unless --no-broadcast
    Send {
        /// Source address (repeatable)
        #[arg(long = "from", required = true)]
        from: Vec<String>,
        /// Destination as ADDRESS:SATS (repeatable)
        #[arg(long = "to", required = true)]
        to: Vec<String>,
        /// Signing key in WIF (repeatable)
        #[arg(long = "wif", required = true)]
        wif: Vec<String>,
        /// Explicit rate in sat/vB; skips estimation
        #[arg(long)]
        fee_rate: Option<f64>,
        #[arg(long, default_value = "medium")]
        priority: Priority,
        #[arg(long)]
        change: Option<String>,
        /// Print the signed transaction instead of broadcasting it
        #[arg(long)]
        no_broadcast: bool,
    },
    /// Broadcast a raw transaction
    Broadcast { raw_tx: String },
    /// Validate a raw transaction against prevouts from a JSON file
    Validate {
        raw_tx: String,
        /// JSON array of UTXOs spent by the transaction
        #[arg(long)]
        prevouts: PathBuf,
    },
    /// Confirmation status of a transaction
    Status { txid: String },
    /// Poll until a transaction confirms, then refresh addresses
    Track {
        txid: String,
        #[arg(long = "address")]
        addresses: Vec<String>,
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
        #[arg(long, default_value_t = 120)]
        max_polls: usize,
    },
    /// Drop cache entries older than the configured TTL
    Evict,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeygenKind {
    Entropy,
    Bip39,
    Bip32,
}

/// Apply command-line overrides to the loaded configuration
pub fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(network) = args.network {
        config.network = network;
    }
    if let Some(backend) = args.backend {
        config.builder = backend;
    }
}

pub async fn run(args: Args, config: Config) -> Result<()> {
    let network = config.network;

    // Key commands never touch the provider
    match &args.command {
        Command::Keygen { method, mnemonic, path } => return keygen(*method, mnemonic.clone(), path, network),
        Command::Address { wif, script_type } => {
            let key = KeyMaterial::from_wif(wif, network)?;
            println!("{}", address_for(&key, *script_type, network)?);
            return Ok(());
        }
        _ => {}
    }

    let engine = WalletEngine::open(config)?;
    engine.set_offline(args.offline);

    match args.command {
        Command::Fees => {
            let table = engine.fee_table().await;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else {
                for estimate in table {
                    let source = match estimate.source {
                        FeeSource::Live => "live",
                        FeeSource::Cached => "cached",
                    };
                    println!("{:<7} {:>8.2} sat/vB  ({})", estimate.priority, estimate.rate_sat_per_vbyte, source);
                }
            }
        }
        Command::Balance { address } => {
            let (balance, freshness) = engine.balance(&address, args.offline).await?;
            println!("💰 {} sats{}", balance, stale_marker(freshness));
        }
        Command::Utxos { address } => {
            let (entry, freshness) = engine.utxos(&address, args.offline).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("{} UTXOs, {} sats{}", entry.utxo_set.len(), entry.balance, stale_marker(freshness));
                for utxo in &entry.utxo_set {
                    println!("  {}:{}  {:>12} sats  {} conf", utxo.txid, utxo.vout, utxo.value, utxo.confirmations);
                }
            }
        }
        Command::Send { from, to, wif, fee_rate, priority, change, no_broadcast } => {
            let keys = wif
                .iter()
                .map(|w| KeyMaterial::from_wif(w, network))
                .collect::<crate::error::Result<Vec<_>>>()?;
            let outputs = to.iter().map(|t| parse_destination(t, network)).collect::<Result<Vec<_>>>()?;
            let request = SendRequest {
                from_addresses: from,
                explicit_inputs: None,
                outputs,
                fee: fee_rate.map(FeeChoice::Rate).unwrap_or(FeeChoice::Priority(priority)),
                change_address: change,
                force_offline: args.offline,
                backend: args.backend,
            };

            let prepared = if no_broadcast || args.offline {
                engine.prepare(&request, &keys).await?
            } else {
                engine.send(&request, &keys).await?
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&prepared.report)?);
            } else {
                println!("🆔 {}", prepared.txid);
                println!(
                    "   fee {} sats at {:.2} sat/vB ({} vB)",
                    prepared.report.fee, prepared.report.fee_rate_sat_per_vbyte, prepared.report.vsize
                );
            }
            if no_broadcast || args.offline {
                println!("{}", prepared.raw_hex);
            } else if let Some(url) = engine.gateway().explorer_url(&prepared.txid) {
                println!("🔗 {}", url);
            }
        }
        Command::Broadcast { raw_tx } => {
            let txid = engine.broadcast(&raw_tx).await?;
            println!("✅ {}", txid);
        }
        Command::Validate { raw_tx, prevouts } => {
            let contents = std::fs::read_to_string(&prevouts)
                .with_context(|| format!("Failed to read prevouts from {}", prevouts.display()))?;
            let prevouts: Vec<Utxo> = serde_json::from_str(&contents).context("Prevouts must be a JSON array of UTXOs")?;
            let report = engine.validate(&raw_tx, prevouts)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{} {}", if report.is_valid { "✅" } else { "❌" }, report.txid);
                println!(
                    "   {} in / {} out, fee {} sats ({:.2} sat/vB), signed: {}",
                    report.input_count, report.output_count, report.fee, report.fee_rate_sat_per_vbyte, report.is_signed
                );
                for issue in &report.issues {
                    match issue.input_index {
                        Some(i) => println!("   input {}: {}", i, issue.message),
                        None => println!("   {}", issue.message),
                    }
                }
            }
        }
        Command::Status { txid } => {
            let report = engine.status(&txid).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{:?}", report.status);
                if let Some(url) = report.explorer_url {
                    println!("🔗 {}", url);
                }
            }
        }
        Command::Track { txid, addresses, interval_secs, max_polls } => {
            let options = TrackOptions { interval: Duration::from_secs(interval_secs), max_polls };
            let status = engine.track(&txid, &addresses, options).await?;
            println!("{:?}", status);
        }
        Command::Evict => {
            let removed = engine.evict_expired()?;
            println!("🧹 Removed {} entries", removed);
        }
        Command::Keygen { .. } | Command::Address { .. } => {}
    }

    Ok(())
}

fn keygen(kind: KeygenKind, mnemonic: Option<String>, path: &str, network: Network) -> Result<()> {
    let method = match kind {
        KeygenKind::Entropy => KeyGenMethod::Entropy,
        KeygenKind::Bip39 => KeyGenMethod::Bip39 { mnemonic },
        KeygenKind::Bip32 => KeyGenMethod::Bip32 { mnemonic, path: path.to_string() },
    };
    let generated = generate_key(method, network)?;

    if let Some(words) = &generated.mnemonic {
        println!("🔐 Mnemonic (write this down): {}", words.as_str());
    }
    if let Some(path) = generated.key.derivation_path() {
        println!("   Path: {}", path);
    }
    println!("   WIF:  {}", generated.key.to_wif().as_str());
    for script_type in ScriptType::ALL {
        println!("   {:<7} {}", script_type, address_for(&generated.key, script_type, network)?);
    }
    Ok(())
}

/// `ADDRESS:SATS`
fn parse_destination(destination: &str, network: Network) -> Result<TxOutput> {
    let (address, amount) = destination
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Destination must be ADDRESS:SATS, got {}", destination))?;
    let value: u64 = amount.parse().with_context(|| format!("Invalid amount in {}", destination))?;
    Ok(TxOutput::to_address(address, network, value)?)
}

fn stale_marker(freshness: Freshness) -> &'static str {
    match freshness {
        Freshness::Live => "",
        Freshness::Stale => " (cached)",
    }
}
