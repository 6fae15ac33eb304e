//! Dataset, record and cache envelope types
//!
//! A dataset maps subject ids (author url tokens) to affiliation names.
//! Three logical datasets exist at runtime: the remote one fetched on
//! demand, the cached snapshot persisted with an expiration, and the local
//! per-subject entries harvested by the extraction observer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store key holding the cached dataset (JSON object text)
pub const CACHE_DATA_KEY: &str = "mcn_data_cache";

/// Store key holding the cache expiration (epoch milliseconds)
pub const CACHE_EXPIRATION_KEY: &str = "mcn_data_cache_expiration";

/// Default cache lifetime: 24 hours
pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Subject id → affiliation
pub type Dataset = BTreeMap<String, String>;

/// True for the two keys reserved by the cache envelope
///
/// Reserved keys never name a subject and are skipped when enumerating
/// local records.
pub fn is_reserved_key(key: &str) -> bool {
    key == CACHE_DATA_KEY || key == CACHE_EXPIRATION_KEY
}

/// One harvested observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub subject_id: String,
    pub affiliation: String,
}

impl Record {
    pub fn new(subject_id: impl Into<String>, affiliation: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            affiliation: affiliation.into(),
        }
    }
}

/// Persisted dataset bundled with its expiration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub data: Dataset,
    pub expires_at: DateTime<Utc>,
}

impl CacheEnvelope {
    /// Build an envelope that expires `ttl` after `now`
    pub fn new(data: Dataset, now: DateTime<Utc>, ttl: std::time::Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self { data, expires_at }
    }

    /// A cache hit requires `now < expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Parse a dataset from JSON text
///
/// Any shape other than an object of strings is rejected.
pub fn dataset_from_json(text: &str) -> serde_json::Result<Dataset> {
    serde_json::from_str(text)
}
