//! KV store adapter: typed read/write of the three logical collections against `sled`.
//!
//! `sled` has no native TTL index or composite-unique index, so both are emulated: every
//! stored document carries its own expiry/key fields and callers never trust the background
//! sweep alone for correctness. The sweep in [`Store::spawn_cache_reaper`] is
//! bookkeeping, not a correctness dependency.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GatewayError;

const CACHE_PREFIX: &[u8] = b"cache:";
const HISTORY_PREFIX: &[u8] = b"history:";
const QUOTA_KEY: &[u8] = b"quota:singleton";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaDoc {
    pub month: String,
    pub count: u64,
    pub max_calls: u64,
    pub updated_at: i64,
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Opens (or creates) the sled database at `path`. Index creation for the cache and
    /// history collections is implicit in their key layout and therefore idempotent
    /// by construction: there is nothing to "create" beyond opening the tree.
    pub fn open(path: &Path) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    // ---- cache collection -------------------------------------------------

    pub fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>, GatewayError> {
        let full_key = cache_key(key);
        let raw = self
            .db
            .get(&full_key)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        match raw {
            Some(bytes) => {
                let entry: CacheEntry = serde_json::from_slice(&bytes).map_err(|e| {
                    GatewayError::StoreUnavailable(format!("corrupt cache entry: {e}"))
                })?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    pub fn cache_put(&self, key: &str, payload: serde_json::Value, ttl: Duration) -> Result<(), GatewayError> {
        let now = now_unix();
        let entry = CacheEntry {
            payload,
            created_at: now,
            expires_at: now + ttl.as_secs() as i64,
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| GatewayError::StoreUnavailable(format!("encode cache entry: {e}")))?;
        self.db
            .insert(cache_key(key), bytes)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Physically deletes cache entries whose `expires_at` is in the past. Runs on an
    /// interval in the background; readers never depend on having run.
    pub fn spawn_cache_reaper(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_expired_cache_entries() {
                    warn!(error = %e, "cache reaper sweep failed");
                }
            }
        });
    }

    fn reap_expired_cache_entries(&self) -> Result<usize, GatewayError> {
        let now = now_unix();
        let mut removed = 0usize;
        for item in self.db.scan_prefix(CACHE_PREFIX) {
            let (k, v) = item.map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
            let Ok(entry) = serde_json::from_slice::<CacheEntry>(&v) else {
                continue;
            };
            if entry.expires_at <= now {
                self.db
                    .remove(&k)
                    .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "cache reaper swept expired entries");
        }
        Ok(removed)
    }

    // ---- quota ledger (singleton) -----------------------------------------

    pub fn quota_load(&self) -> Result<Option<QuotaDoc>, GatewayError> {
        let raw = self
            .db
            .get(QUOTA_KEY)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        match raw {
            Some(bytes) => {
                let doc: QuotaDoc = serde_json::from_slice(&bytes).map_err(|e| {
                    GatewayError::StoreUnavailable(format!("corrupt quota ledger: {e}"))
                })?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Unconditional replace of the singleton document. Callers needing an atomicity
    /// guarantee must go through [`Store::quota_compare_and_swap`] instead.
    pub fn quota_store(&self, doc: &QuotaDoc) -> Result<(), GatewayError> {
        let bytes = serde_json::to_vec(doc)
            .map_err(|e| GatewayError::StoreUnavailable(format!("encode quota ledger: {e}")))?;
        self.db
            .insert(QUOTA_KEY, bytes)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Compare-and-swap on the raw quota document bytes. `expected` is the value last
    /// observed by the caller (`None` if the document did not exist yet); `new` is the
    /// document to install. Returns `Ok(true)` on success, `Ok(false)` if another writer
    /// raced ahead and the caller should re-read and retry.
    pub fn quota_compare_and_swap(
        &self,
        expected: Option<&QuotaDoc>,
        new: &QuotaDoc,
    ) -> Result<bool, GatewayError> {
        let expected_bytes = expected
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| GatewayError::StoreUnavailable(format!("encode quota ledger: {e}")))?;
        let new_bytes = serde_json::to_vec(new)
            .map_err(|e| GatewayError::StoreUnavailable(format!("encode quota ledger: {e}")))?;
        match self
            .db
            .compare_and_swap(QUOTA_KEY, expected_bytes, Some(new_bytes))
        {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_cas_error)) => Ok(false),
            Err(e) => Err(GatewayError::StoreUnavailable(e.to_string())),
        }
    }

    // ---- history collection (optional adjunct) -----------------------------

    pub fn history_upsert(
        &self,
        flight_iata: &str,
        flight_date: &str,
        doc: serde_json::Value,
    ) -> Result<(), GatewayError> {
        let bytes = serde_json::to_vec(&doc)
            .map_err(|e| GatewayError::StoreUnavailable(format!("encode history doc: {e}")))?;
        self.db
            .insert(history_key(flight_iata, flight_date), bytes)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Returns history documents for `flight_iata` whose `flight_date` falls within
    /// `[start_date, end_date]` inclusive, ordered by date ascending. Dates compare
    /// lexicographically, which is correct for `YYYY-MM-DD`.
    pub fn history_query(
        &self,
        flight_iata: &str,
        start_date: &str,
        end_date: &str,
    ) -> Result<Vec<serde_json::Value>, GatewayError> {
        let prefix = format!("{}{}:", String::from_utf8_lossy(HISTORY_PREFIX), flight_iata);
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
            let key_str = String::from_utf8_lossy(&k);
            let Some(date) = key_str.rsplit(':').next() else {
                continue;
            };
            if date >= start_date && date <= end_date {
                if let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&v) {
                    out.push((date.to_string(), doc));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, doc)| doc).collect())
    }
}

fn cache_key(key: &str) -> Vec<u8> {
    [CACHE_PREFIX, key.as_bytes()].concat()
}

fn history_key(flight_iata: &str, flight_date: &str) -> Vec<u8> {
    format!(
        "{}{}:{}",
        String::from_utf8_lossy(HISTORY_PREFIX),
        flight_iata,
        flight_date
    )
    .into_bytes()
}

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn cache_put_then_get_round_trips() {
        let (store, _dir) = open_tmp();
        store
            .cache_put("airports:iata_code=CDG", serde_json::json!({"ok": true}), Duration::from_secs(60))
            .unwrap();
        let entry = store.cache_get("airports:iata_code=CDG").unwrap().unwrap();
        assert_eq!(entry.payload, serde_json::json!({"ok": true}));
        assert!(entry.expires_at > entry.created_at);
    }

    #[test]
    fn cache_get_on_missing_key_is_none() {
        let (store, _dir) = open_tmp();
        assert!(store.cache_get("nope").unwrap().is_none());
    }

    #[test]
    fn quota_cas_rejects_stale_expected() {
        let (store, _dir) = open_tmp();
        let doc = QuotaDoc {
            month: "2026-08".into(),
            count: 1,
            max_calls: 10_000,
            updated_at: now_unix(),
        };
        assert!(store.quota_compare_and_swap(None, &doc).unwrap());

        let stale_next = QuotaDoc {
            count: 2,
            ..doc.clone()
        };
        // Expected `None` again: stale, another writer already installed `doc`.
        assert!(!store.quota_compare_and_swap(None, &stale_next).unwrap());

        let fresh_next = QuotaDoc {
            count: 2,
            ..doc.clone()
        };
        assert!(store
            .quota_compare_and_swap(Some(&doc), &fresh_next)
            .unwrap());
        assert_eq!(store.quota_load().unwrap().unwrap().count, 2);
    }

    #[test]
    fn reaper_removes_only_expired_entries() {
        let (store, _dir) = open_tmp();
        store
            .cache_put("fresh", serde_json::json!(1), Duration::from_secs(300))
            .unwrap();
        store
            .cache_put("stale", serde_json::json!(2), Duration::from_secs(0))
            .unwrap();
        // zero-TTL entry already expired by the time we sweep a second later.
        std::thread::sleep(Duration::from_millis(1100));
        let removed = store.reap_expired_cache_entries().unwrap();
        assert_eq!(removed, 1);
        assert!(store.cache_get("fresh").unwrap().is_some());
        assert!(store.cache_get("stale").unwrap().is_none());
    }

    #[test]
    fn history_query_filters_and_orders_by_date() {
        let (store, _dir) = open_tmp();
        store
            .history_upsert("AF447", "2025-11-01", serde_json::json!({"status": "landed"}))
            .unwrap();
        store
            .history_upsert("AF447", "2025-11-03", serde_json::json!({"status": "landed"}))
            .unwrap();
        store
            .history_upsert("AF447", "2025-10-01", serde_json::json!({"status": "landed"}))
            .unwrap();
        let docs = store
            .history_query("AF447", "2025-11-01", "2025-11-30")
            .unwrap();
        assert_eq!(docs.len(), 2);
    }
}
