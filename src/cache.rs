//! Response cache: key-to-payload with a single configured TTL.
//!
//! The cache is negative-result oblivious — only [`Cache::put`] writes an entry, and nothing
//! upstream of it ever calls `put` for a non-2xx outcome (see [`crate::upstream`]).

use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayError;
use crate::store::{now_unix, Store};

pub struct Cache {
    store: Arc<Store>,
    ttl: Duration,
}

pub enum CacheLookup {
    Hit(serde_json::Value),
    Miss,
}

impl Cache {
    pub fn new(store: Arc<Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn get(&self, key: &str) -> Result<CacheLookup, GatewayError> {
        let Some(entry) = self.store.cache_get(key)? else {
            return Ok(CacheLookup::Miss);
        };
        // Never trust the background reaper alone: an entry observed past its expiry is a
        // miss even if the key technically still exists in the store.
        if entry.expires_at <= now_unix() {
            return Ok(CacheLookup::Miss);
        }
        Ok(CacheLookup::Hit(entry.payload))
    }

    pub fn put(&self, key: &str, payload: serde_json::Value) -> Result<(), GatewayError> {
        self.store.cache_put(key, payload, self.ttl)
    }
}

/// Canonical cache key: `"{endpoint}:{params-normalised}"`, where `params-normalised` is a
/// deterministic serialisation of the query parameters sorted by name. Identical parameter
/// sets in different insertion orders must produce byte-identical keys.
pub fn cache_key(endpoint: &str, params: &[(&str, &str)]) -> String {
    let mut sorted: Vec<&(&str, &str)> = params.iter().filter(|(_, v)| !v.is_empty()).collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let normalised = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{endpoint}:{normalised}")
}
