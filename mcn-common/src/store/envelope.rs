//! Cache envelope persistence
//!
//! The envelope is stored under two reserved keys: the dataset as JSON
//! text and the expiration as epoch milliseconds. The keys are written
//! independently; an observer fold rewrites only the data key.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{absent_on_error, PersistentStore};
use crate::dataset::{dataset_from_json, CacheEnvelope, Dataset, Record, CACHE_DATA_KEY, CACHE_EXPIRATION_KEY};
use crate::{time, Error, Result};

/// Cached dataset, regardless of expiration
///
/// Unreadable or malformed data reads as absent.
pub async fn read_cached_data(store: &dyn PersistentStore) -> Option<Dataset> {
    let raw = absent_on_error(store.get(CACHE_DATA_KEY).await, CACHE_DATA_KEY)?;
    match dataset_from_json(&raw) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(error = %e, "Cached dataset is not valid JSON, ignoring it");
            None
        }
    }
}

/// Stored cache expiration, if any
pub async fn read_expiration(store: &dyn PersistentStore) -> Option<DateTime<Utc>> {
    let raw = absent_on_error(store.get(CACHE_EXPIRATION_KEY).await, CACHE_EXPIRATION_KEY)?;
    raw.trim().parse::<i64>().ok().and_then(time::from_epoch_millis)
}

/// Full envelope; `None` unless both halves are present
pub async fn read_envelope(store: &dyn PersistentStore) -> Option<CacheEnvelope> {
    let data = read_cached_data(store).await?;
    let expires_at = read_expiration(store).await?;
    Some(CacheEnvelope { data, expires_at })
}

/// Persist a complete envelope (data, then expiration)
///
/// Fails with [`Error::PartialWrite`] when the data was written but the
/// expiration was not; the stored expiration is then the previous one.
pub async fn write_envelope(store: &dyn PersistentStore, envelope: &CacheEnvelope) -> Result<()> {
    let data = serde_json::to_string(&envelope.data)?;
    store.set(CACHE_DATA_KEY, &data).await?;
    store
        .set(CACHE_EXPIRATION_KEY, &time::to_epoch_millis(envelope.expires_at).to_string())
        .await
        .map_err(|e| Error::PartialWrite(format!("cache data written, expiration not: {e}")))
}

/// Add one record to the cached dataset, leaving the expiration alone
///
/// A missing or unreadable cached dataset starts from empty.
pub async fn fold_into_cached_data(store: &dyn PersistentStore, record: &Record) -> Result<Dataset> {
    let mut data = read_cached_data(store).await.unwrap_or_default();
    data.insert(record.subject_id.clone(), record.affiliation.clone());
    store.set(CACHE_DATA_KEY, &serde_json::to_string(&data)?).await?;
    Ok(data)
}
