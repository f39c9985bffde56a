mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use coldwallet::blockchain_data::ProviderTxStatus;
use coldwallet::config::Network;
use coldwallet::keys::address_for;
use coldwallet::types::FeeSource;
use coldwallet::{FeeChoice, Freshness, Priority, ScriptType, SendRequest, TxOutput, TxStatus, WalletError};

use common::{engine_with, provider_utxo, test_config, test_key, utxo_for, MockProvider, RecordingHooks, TIP_HEIGHT};

fn pay_to(byte: u8, value: u64) -> TxOutput {
    let key = test_key(byte, Network::Testnet);
    TxOutput::to_address(&address_for(&key, ScriptType::P2tr, Network::Testnet).unwrap(), Network::Testnet, value).unwrap()
}

#[tokio::test]
async fn test_send_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let key = test_key(1, Network::Testnet);
    let address = address_for(&key, ScriptType::P2wpkh, Network::Testnet).unwrap();
    provider.set_utxos(&address, vec![provider_utxo(0xa1, 0, 60_000), provider_utxo(0xa2, 1, 25_000)]);

    let hooks = Arc::new(RecordingHooks::default());
    let engine = engine_with(provider.clone(), test_config(&dir, Network::Testnet)).with_hooks(hooks.clone());

    let request = SendRequest {
        from_addresses: vec![address.clone()],
        outputs: vec![pay_to(2, 50_000)],
        fee: FeeChoice::Priority(Priority::Medium),
        ..SendRequest::default()
    };
    let sent = engine.send(&request, &[key]).await.unwrap();

    // medium maps to the 50th percentile of the mock's bands
    assert_eq!(sent.fee_estimate.as_ref().map(|e| e.source), Some(FeeSource::Live));
    assert_eq!(sent.fee_rate, 8.0);
    assert!(sent.report.is_valid);
    assert_eq!(sent.signed.tx.inputs.len(), 1);
    assert_eq!(sent.freshness, vec![(address.clone(), Freshness::Live)]);
    assert_eq!(provider.broadcasts.lock().unwrap().as_slice(), &[sent.raw_hex.clone()]);

    let finalized = hooks.finalized.lock().unwrap();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].txid, sent.txid);
    assert_eq!(finalized[0].source_addresses, vec![address]);
}

#[tokio::test]
async fn test_prepare_offline_from_cache_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let key = test_key(3, Network::Testnet);
    let address = address_for(&key, ScriptType::P2tr, Network::Testnet).unwrap();
    provider.set_utxos(&address, vec![provider_utxo(0xb1, 0, 90_000)]);

    let mut config = test_config(&dir, Network::Testnet);
    config.cache_ttl_secs = 0;
    let engine = engine_with(provider.clone(), config);

    let (live, freshness) = engine.utxos(&address, false).await.unwrap();
    assert_eq!(freshness, Freshness::Live);
    assert_eq!(live.utxo_set[0].confirmations, 6);

    // the provider moves on, the cold machine does not see it
    provider.set_utxos(&address, Vec::new());
    engine.set_offline(true);
    assert_eq!(engine.evict_expired().unwrap(), 0);

    let calls = provider.utxo_calls.load(Ordering::SeqCst);
    let (stale, freshness) = engine.utxos(&address, true).await.unwrap();
    assert_eq!(freshness, Freshness::Stale);
    assert_eq!(stale, live);

    let request = SendRequest {
        from_addresses: vec![address.clone()],
        outputs: vec![pay_to(4, 30_000)],
        fee: FeeChoice::Rate(3.0),
        force_offline: true,
        ..SendRequest::default()
    };
    let prepared = engine.prepare(&request, &[key]).await.unwrap();
    assert!(prepared.report.is_valid);
    assert_eq!(prepared.freshness, vec![(address, Freshness::Stale)]);
    assert_eq!(provider.utxo_calls.load(Ordering::SeqCst), calls);
    assert!(provider.broadcasts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_offline_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let key = test_key(5, Network::Testnet);
    let address = address_for(&key, ScriptType::P2pkh, Network::Testnet).unwrap();
    provider.set_utxos(&address, vec![provider_utxo(0xc1, 2, 12_345)]);

    {
        let engine = engine_with(provider.clone(), test_config(&dir, Network::Testnet));
        engine.utxos(&address, false).await.unwrap();
    }

    let engine = engine_with(provider, test_config(&dir, Network::Testnet));
    let (balance, freshness) = engine.balance(&address, true).await.unwrap();
    assert_eq!(balance, 12_345);
    assert_eq!(freshness, Freshness::Stale);
}

#[tokio::test]
async fn test_forced_offline_never_fetched_is_cache_miss() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let engine = engine_with(provider.clone(), test_config(&dir, Network::Testnet));
    let address = address_for(&test_key(6, Network::Testnet), ScriptType::P2wpkh, Network::Testnet).unwrap();

    let result = engine.utxos(&address, true).await;
    assert!(matches!(result, Err(WalletError::CacheMiss { .. })));
    assert_eq!(provider.utxo_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_provider_down_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let key = test_key(7, Network::Testnet);
    let address = address_for(&key, ScriptType::P2wpkh, Network::Testnet).unwrap();
    provider.set_utxos(&address, vec![provider_utxo(0xd1, 0, 40_000)]);
    let engine = engine_with(provider.clone(), test_config(&dir, Network::Testnet));

    let live_table = engine.fee_table().await;
    assert_eq!(live_table.len(), 3);
    engine.utxos(&address, false).await.unwrap();

    provider.set_down(true);
    engine.fees().clear_cache().await;

    // persisted fee estimates outlive the in-memory cache
    let table = engine.fee_table().await;
    assert!(table.iter().all(|e| e.source == FeeSource::Cached));
    let rates: Vec<f64> = table.iter().map(|e| e.rate_sat_per_vbyte).collect();
    let live_rates: Vec<f64> = live_table.iter().map(|e| e.rate_sat_per_vbyte).collect();
    assert_eq!(rates, live_rates);

    let (_, freshness) = engine.utxos(&address, false).await.unwrap();
    assert_eq!(freshness, Freshness::Stale);

    let request = SendRequest {
        from_addresses: vec![address],
        outputs: vec![pay_to(8, 10_000)],
        ..SendRequest::default()
    };
    let result = engine.send(&request, &[key]).await;
    assert!(matches!(result, Err(WalletError::Provider(_))));
}

#[tokio::test]
async fn test_hook_utxos_join_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let key = test_key(9, Network::Testnet);
    let address = address_for(&key, ScriptType::P2wpkh, Network::Testnet).unwrap();
    provider.set_utxos(&address, vec![provider_utxo(0xe1, 0, 5_000)]);

    let hooks = Arc::new(RecordingHooks::default());
    hooks
        .extra
        .lock()
        .unwrap()
        .insert(address.clone(), vec![utxo_for(&key, ScriptType::P2wpkh, 0xe2, 0, 70_000)]);
    let engine = engine_with(provider, test_config(&dir, Network::Testnet)).with_hooks(hooks);

    let request = SendRequest {
        from_addresses: vec![address],
        outputs: vec![pay_to(1, 60_000)],
        fee: FeeChoice::Rate(1.0),
        ..SendRequest::default()
    };
    let prepared = engine.prepare(&request, &[key]).await.unwrap();
    assert_eq!(prepared.signed.prevouts.len(), 1);
    assert_eq!(prepared.signed.prevouts[0].value, 70_000);
}

#[tokio::test]
async fn test_status_with_explorer_url() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let txid = "ee".repeat(32);
    provider.set_status(&txid, ProviderTxStatus { confirmed: true, block_height: Some(TIP_HEIGHT - 2) });
    let engine = engine_with(provider, test_config(&dir, Network::Testnet));

    let report = engine.status(&txid).await.unwrap();
    assert_eq!(report.status, TxStatus::Confirmed { height: TIP_HEIGHT - 2, confirmations: 3 });
    assert_eq!(report.explorer_url, Some(format!("https://explorer.invalid/tx/{}", txid)));

    let unknown = engine.status(&"00".repeat(32)).await.unwrap();
    assert_eq!(unknown.status, TxStatus::NotFound);
}

#[tokio::test]
async fn test_regtest_fees_use_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Regtest));
    let engine = engine_with(provider, test_config(&dir, Network::Regtest));

    let table = engine.fee_table().await;
    let rates: Vec<f64> = table.iter().map(|e| e.rate_sat_per_vbyte).collect();
    assert_eq!(rates, vec![1.0, 2.0, 5.0]);
    assert!(table.iter().all(|e| e.source == FeeSource::Cached));
}

#[tokio::test]
async fn test_transient_provider_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(Network::Testnet));
    let key = test_key(11, Network::Testnet);
    let address = address_for(&key, ScriptType::P2wpkh, Network::Testnet).unwrap();
    provider.set_utxos(&address, vec![provider_utxo(0xf1, 0, 33_000)]);
    let engine = engine_with(provider.clone(), test_config(&dir, Network::Testnet));

    // never fetched before, so a single 503 would otherwise be a cache miss
    provider.fail_next(1);
    let (entry, freshness) = engine.utxos(&address, false).await.unwrap();
    assert_eq!(freshness, Freshness::Live);
    assert_eq!(entry.balance, 33_000);
    assert_eq!(provider.utxo_calls.load(Ordering::SeqCst), 2);

    provider.fail_next(2);
    let table = engine.fee_table().await;
    assert!(table.iter().all(|e| e.source == FeeSource::Live));
}
