//! Reconciliation of remote, cached and local datasets
//!
//! Two precedence rules coexist and are kept as separate functions:
//!
//! - On refresh, the fetched dataset wins over local observations
//!   ([`merge_remote_over_local`]) and the result becomes the new cache.
//! - On lookup and export, local observations win over the cache
//!   ([`overlay_local_over_cached`]).
//!
//! Local entries are durable per-subject keys, so they are re-applied on
//! every lookup no matter what the last refresh merged.

use mcn_common::store::{local_record, local_records, read_cached_data, read_expiration, write_envelope};
use mcn_common::{time, CacheEnvelope, Dataset, Error, PersistentStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::fetcher::DatasetSource;

/// Refresh merge: remote values override local ones on key collision
pub fn merge_remote_over_local(local: &Dataset, remote: &Dataset) -> Dataset {
    let mut merged = local.clone();
    merged.extend(remote.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Lookup/export overlay: local values override cached ones
pub fn overlay_local_over_cached(cached: &Dataset, local: &Dataset) -> Dataset {
    let mut merged = cached.clone();
    merged.extend(local.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Result of a refresh attempt
#[derive(Debug)]
pub enum RefreshOutcome {
    /// New cache persisted
    Updated { entries: usize },
    /// New cache in memory only; the store write failed or stopped halfway
    Unpersisted { entries: usize, error: String },
    /// Cache still valid, nothing fetched
    Fresh,
    /// Fetch failed; cache left untouched
    Failed(FetchError),
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, RefreshOutcome::Failed(_))
    }
}

/// Sizes reported alongside an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportStats {
    pub cached: usize,
    pub local: usize,
    pub merged: usize,
}

/// Owns the in-memory remote and cached views over the durable store
pub struct ReconciliationEngine {
    store: Arc<dyn PersistentStore>,
    source: Arc<dyn DatasetSource>,
    cache_ttl: Duration,
    remote: RwLock<Dataset>,
    cached: RwLock<Dataset>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn PersistentStore>, source: Arc<dyn DatasetSource>, cache_ttl: Duration) -> Self {
        Self {
            store,
            source,
            cache_ttl,
            remote: RwLock::new(Dataset::new()),
            cached: RwLock::new(Dataset::new()),
        }
    }

    /// Load the persisted cache into memory, expired or not
    ///
    /// Stale data stays usable as a fallback; expiration only matters to
    /// [`Self::refresh_if_stale`]. Returns whether a cache was found.
    pub async fn load_cache(&self) -> bool {
        match read_cached_data(self.store.as_ref()).await {
            Some(data) => {
                debug!(entries = data.len(), "Loaded cached dataset");
                *self.cached.write().await = data;
                true
            }
            None => false,
        }
    }

    /// True iff an expiration is stored and has not been reached
    pub async fn is_cache_valid(&self) -> bool {
        match read_expiration(self.store.as_ref()).await {
            Some(expires_at) => time::now() < expires_at,
            None => false,
        }
    }

    /// Fetch the remote dataset and rebuild the cache
    ///
    /// On failure the in-memory and persisted cache are left exactly as
    /// they were.
    pub async fn refresh(&self) -> RefreshOutcome {
        let remote = match self.source.fetch().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "MCN dataset update failed");
                return RefreshOutcome::Failed(e);
            }
        };

        let local = local_records(self.store.as_ref()).await;
        let merged = merge_remote_over_local(&local, &remote);
        let entries = merged.len();

        let envelope = CacheEnvelope::new(merged, time::now(), self.cache_ttl);
        let persisted = write_envelope(self.store.as_ref(), &envelope).await;

        *self.cached.write().await = envelope.data;
        *self.remote.write().await = remote;

        match persisted {
            Ok(()) => {
                info!(entries, local = local.len(), "MCN dataset updated");
                RefreshOutcome::Updated { entries }
            }
            Err(e @ Error::PartialWrite(_)) => {
                error!(error = %e, "Refreshed cache stored under its previous expiration");
                RefreshOutcome::Unpersisted { entries, error: e.to_string() }
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist refreshed cache, keeping it in memory only");
                RefreshOutcome::Unpersisted { entries, error: e.to_string() }
            }
        }
    }

    /// Refresh only when the persisted cache has expired or is missing
    pub async fn refresh_if_stale(&self) -> RefreshOutcome {
        if self.is_cache_valid().await {
            debug!("Cache still valid, skipping refresh");
            RefreshOutcome::Fresh
        } else {
            self.refresh().await
        }
    }

    /// Affiliation for a subject: local entry first, then cached dataset
    pub async fn lookup(&self, subject_id: &str) -> Option<String> {
        if let Some(local) = local_record(self.store.as_ref(), subject_id).await {
            return Some(local);
        }
        self.cached
            .read()
            .await
            .get(subject_id)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    /// Everything known, local entries overriding the persisted cache
    pub async fn export_all(&self) -> Dataset {
        self.export_with_stats().await.0
    }

    pub async fn export_with_stats(&self) -> (Dataset, ExportStats) {
        let cached = read_cached_data(self.store.as_ref()).await.unwrap_or_default();
        let local = local_records(self.store.as_ref()).await;
        let merged = overlay_local_over_cached(&cached, &local);

        let stats = ExportStats {
            cached: cached.len(),
            local: local.len(),
            merged: merged.len(),
        };
        info!(
            cached = stats.cached,
            local = stats.local,
            merged = stats.merged,
            "Export dataset assembled"
        );

        (merged, stats)
    }

    /// Snapshot of the in-memory cached view
    pub async fn cached(&self) -> Dataset {
        self.cached.read().await.clone()
    }

    /// Last successfully fetched remote dataset (empty until a refresh)
    pub async fn remote(&self) -> Dataset {
        self.remote.read().await.clone()
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }
}
