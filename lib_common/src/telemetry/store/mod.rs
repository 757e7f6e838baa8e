//! # Reading Store
//!
//! The persistence contract the engine needs: append, latest, history and trim.
//! Any backend implementing [`ReadingStore`] can be plugged in; the engine only
//! ever talks to it through [`Store`], which serialises every operation behind a
//! single async mutex so appends, queries and trims never interleave.

/// In-process backend, used by tests and the `memory` storage option.
pub mod memory;
/// SQLite backend built on `sqlx`.
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use super::reading::Reading;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(String),
    #[error("Failed to prepare schema: {0}")]
    SchemaError(String),
    #[error("Query execution failed: {0}")]
    QueryError(String),
    #[error("Failed to create data directory {}: {source}", .path.display())]
    DirectoryError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Stored reading {0} has an invalid timestamp")]
    CorruptRow(i64),
}

/// Backend contract for persisted readings.
///
/// Methods take `&mut self`: exclusivity is provided by [`Store`], so backends
/// need no locking of their own.
pub trait ReadingStore: Send + 'static {
    /// Persists one reading.
    fn append(&mut self, reading: &Reading) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Most recent reading by timestamp, `None` when the store is empty.
    fn latest(&mut self) -> impl Future<Output = Result<Option<Reading>, StoreError>> + Send;

    /// Up to `limit` most recent readings, ordered oldest to newest.
    fn history(&mut self, limit: usize)
        -> impl Future<Output = Result<Vec<Reading>, StoreError>> + Send;

    /// Deletes everything but the `keep` most recent readings. Returns the number
    /// of rows removed.
    fn trim(&mut self, keep: usize) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Serialised access to a [`ReadingStore`] backend.
pub struct Store<S> {
    backend: Mutex<S>,
}

impl<S: ReadingStore> Store<S> {
    pub fn new(backend: S) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        self.backend.lock().await.append(reading).await
    }

    pub async fn latest(&self) -> Result<Option<Reading>, StoreError> {
        self.backend.lock().await.latest().await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<Reading>, StoreError> {
        self.backend.lock().await.history(limit).await
    }

    pub async fn trim(&self, keep: usize) -> Result<u64, StoreError> {
        self.backend.lock().await.trim(keep).await
    }

    /// Sequence number the generator should continue from.
    pub async fn next_seq(&self) -> Result<u64, StoreError> {
        Ok(self.latest().await?.map_or(1, |r| r.seq + 1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A backend whose every operation fails, counting the attempts.
    #[derive(Default, Clone)]
    pub(crate) struct FailingStore {
        pub(crate) appends: Arc<AtomicUsize>,
        pub(crate) trims: Arc<AtomicUsize>,
    }

    fn unavailable() -> StoreError {
        StoreError::QueryError("database is locked".to_string())
    }

    impl ReadingStore for FailingStore {
        async fn append(&mut self, _reading: &Reading) -> Result<(), StoreError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        }

        async fn latest(&mut self) -> Result<Option<Reading>, StoreError> {
            Err(unavailable())
        }

        async fn history(&mut self, _limit: usize) -> Result<Vec<Reading>, StoreError> {
            Err(unavailable())
        }

        async fn trim(&mut self, _keep: usize) -> Result<u64, StoreError> {
            self.trims.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        }
    }

    #[tokio::test]
    async fn test_failing_backend_surfaces_errors() {
        let backend = FailingStore::default();
        let store = Store::new(backend.clone());
        assert!(matches!(store.latest().await, Err(StoreError::QueryError(_))));
        assert!(store.next_seq().await.is_err());
        assert!(store.trim(10).await.is_err());
        assert_eq!(backend.trims.load(Ordering::SeqCst), 1);
    }
}
