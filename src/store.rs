//! Offline store - durable backing for the UTXO cache and fee fallbacks
//!
//! One SQLite file holds two tables:
//! - `utxo_cache`: (network, address) → balance, UTXO set (JSON), fetched_at
//! - `fee_estimates`: (network, priority) → last live rate, fetched_at
//!
//! Every write is a single `INSERT OR REPLACE`, so a reader sees either the
//! previous entry or the new one, never a mix. The handle is created once at
//! startup and cloned into the components that need it; it also carries the
//! process-wide cold-wallet flag.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Network;
use crate::error::Result;
use crate::types::{CacheEntry, FeeEstimate, FeeSource, Priority, Utxo};

#[derive(Clone)]
pub struct OfflineStore {
    conn: Arc<Mutex<Connection>>,
    offline: Arc<AtomicBool>,
}

impl OfflineStore {
    /// Create or open the store at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path.as_ref())?;
        let store = Self::init(conn)?;

        tracing::info!("📊 Offline store opened: {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Non-persistent store, for tests and one-shot tools
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS utxo_cache (
                network TEXT NOT NULL,
                address TEXT NOT NULL,
                balance INTEGER NOT NULL,
                utxo_set TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (network, address)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cache_fetched_at ON utxo_cache(fetched_at)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS fee_estimates (
                network TEXT NOT NULL,
                priority TEXT NOT NULL,
                rate REAL NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (network, priority)
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            offline: Arc::new(AtomicBool::new(false)),
        })
    }

    // Writes are single statements; a poisoned lock cannot hold a half-applied
    // entry, so recover the guard.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cold-wallet mode: when set, no component performs live fetches
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        tracing::info!("🧊 Offline mode {}", if offline { "enabled" } else { "disabled" });
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Replace the entry for (network, address)
    pub fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        let utxo_json = serde_json::to_string(&entry.utxo_set)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO utxo_cache (network, address, balance, utxo_set, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.network.as_str(),
                entry.address,
                entry.balance as i64,
                utxo_json,
                entry.fetched_at as i64
            ],
        )?;
        Ok(())
    }

    pub fn get_entry(&self, network: Network, address: &str) -> Result<Option<CacheEntry>> {
        let row: Option<(i64, String, i64)> = self
            .lock()
            .query_row(
                "SELECT balance, utxo_set, fetched_at FROM utxo_cache WHERE network = ?1 AND address = ?2",
                params![network.as_str(), address],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            Some((balance, utxo_json, fetched_at)) => {
                let utxo_set: Vec<Utxo> = serde_json::from_str(&utxo_json)?;
                Ok(Some(CacheEntry {
                    network,
                    address: address.to_string(),
                    balance: balance as u64,
                    utxo_set,
                    fetched_at: fetched_at as u64,
                }))
            }
            None => Ok(None),
        }
    }

    /// Addresses with a cached entry on `network`
    pub fn addresses(&self, network: Network) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT address FROM utxo_cache WHERE network = ?1 ORDER BY address")?;
        let mut rows = stmt.query(params![network.as_str()])?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            result.push(row.get(0)?);
        }
        Ok(result)
    }

    /// Delete entries fetched before `cutoff` (unix seconds)
    pub fn delete_fetched_before(&self, cutoff: u64) -> Result<usize> {
        let removed = self
            .lock()
            .execute("DELETE FROM utxo_cache WHERE fetched_at < ?1", params![cutoff as i64])?;
        Ok(removed)
    }

    /// Record the latest live estimate for (network, priority)
    pub fn put_fee(&self, estimate: &FeeEstimate) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO fee_estimates (network, priority, rate, fetched_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                estimate.network.as_str(),
                estimate.priority.as_str(),
                estimate.rate_sat_per_vbyte,
                estimate.fetched_at as i64
            ],
        )?;
        Ok(())
    }

    /// Last recorded estimate, marked as cached
    pub fn get_fee(&self, network: Network, priority: Priority) -> Result<Option<FeeEstimate>> {
        let row: Option<(f64, i64)> = self
            .lock()
            .query_row(
                "SELECT rate, fetched_at FROM fee_estimates WHERE network = ?1 AND priority = ?2",
                params![network.as_str(), priority.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(rate, fetched_at)| FeeEstimate {
            rate_sat_per_vbyte: rate,
            priority,
            source: FeeSource::Cached,
            network,
            fetched_at: fetched_at as u64,
        }))
    }
}
