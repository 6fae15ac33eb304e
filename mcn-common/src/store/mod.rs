//! Durable key/value store
//!
//! The store is the only state shared between the main context and the
//! secondary harvest contexts. It guarantees single-key atomicity and
//! nothing more.
//!
//! Layout: one key per subject id (value = affiliation), plus the two
//! reserved cache envelope keys (see [`crate::dataset`]).

use async_trait::async_trait;
use std::fmt::Display;
use tracing::warn;

use crate::dataset::{is_reserved_key, Dataset};
use crate::Result;

mod envelope;
mod memory;
mod sqlite;

pub use envelope::{fold_into_cached_data, read_cached_data, read_envelope, read_expiration, write_envelope};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key/value persistence shared across contexts
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a value; `Ok(None)` when the key was never written
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Enumerate every stored key, reserved keys included
    async fn list_keys(&self) -> Result<Vec<String>>;
}

/// Collapse a store failure into "absent"
///
/// Callers cannot tell a missing entry from an unreachable store; the
/// failure is only logged.
pub fn absent_on_error<T>(result: Result<Option<T>>, what: impl Display) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Store read failed for {}, treating as absent", what);
            None
        }
    }
}

/// Local record for one subject, `None` if absent, empty, or unreadable
pub async fn local_record(store: &dyn PersistentStore, subject_id: &str) -> Option<String> {
    if is_reserved_key(subject_id) {
        return None;
    }
    absent_on_error(store.get(subject_id).await, subject_id).filter(|v| !v.is_empty())
}

/// All individually persisted subject entries
///
/// Reserved keys and empty values are skipped. An unreadable store yields
/// an empty dataset.
pub async fn local_records(store: &dyn PersistentStore) -> Dataset {
    let keys = match store.list_keys().await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "Store enumeration failed, no local records available");
            return Dataset::new();
        }
    };

    let mut records = Dataset::new();
    for key in keys.into_iter().filter(|k| !is_reserved_key(k)) {
        if let Some(value) = local_record(store, &key).await {
            records.insert(key, value);
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{CACHE_DATA_KEY, CACHE_EXPIRATION_KEY};

    #[tokio::test]
    async fn test_local_records_skips_reserved_and_empty() {
        let store = MemoryStore::new();
        store.set("alice", "MCN A").await.unwrap();
        store.set("bob", "").await.unwrap();
        store.set(CACHE_DATA_KEY, r#"{"carol":"MCN C"}"#).await.unwrap();
        store.set(CACHE_EXPIRATION_KEY, "1").await.unwrap();

        let records = local_records(&store).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records["alice"], "MCN A");
    }

    #[tokio::test]
    async fn test_local_record_never_reads_reserved_key() {
        let store = MemoryStore::new();
        store.set(CACHE_EXPIRATION_KEY, "1700000000000").await.unwrap();

        assert_eq!(local_record(&store, CACHE_EXPIRATION_KEY).await, None);
    }

    #[tokio::test]
    async fn test_unavailable_store_reads_as_absent() {
        let store = MemoryStore::new();
        store.set("alice", "MCN A").await.unwrap();
        store.set_available(false);

        assert_eq!(local_record(&store, "alice").await, None);
        assert!(local_records(&store).await.is_empty());
    }
}
