//! Persistence seam for queue records.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::QueueRecord;

/// Errors reported by a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Future type returned by [`RecordStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Durable storage for queue records.
///
/// Every method acts on a single record and must be atomic for that record.
/// Workers hold the store as `Arc<dyn RecordStore>`.
pub trait RecordStore: Send + Sync + 'static {
    /// Load a record by ID.
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<QueueRecord>>;

    /// Insert or replace a record.
    fn save<'a>(&'a self, record: &'a QueueRecord) -> StoreFuture<'a, ()>;

    /// Set the reservation to `at` if the stored reservation still equals `expected`.
    ///
    /// Returns `false` when another writer changed the reservation first.
    fn reserve<'a>(
        &'a self,
        id: &'a str,
        expected: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool>;

    /// Count a failed execution against the stored record and release its
    /// reservation in one step, returning the updated record.
    ///
    /// Works from the stored attempt counter, never from a caller's copy.
    fn record_failure<'a>(&'a self, id: &'a str, at: DateTime<Utc>) -> StoreFuture<'a, QueueRecord>;

    /// Delete a record. Deleting a missing record is an error.
    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()>;

    /// Records that are unreserved or whose reservation is older than `window`,
    /// oldest first.
    fn list_due(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> StoreFuture<'_, Vec<QueueRecord>>;
}

/// Record store kept in process memory.
///
/// Useful for tests and for embedding the pool without a database.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, QueueRecord>>,
}

impl InMemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record without going through the async API.
    pub fn insert(&self, record: QueueRecord) {
        self.records().insert(record.id.clone(), record);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Copy of a stored record.
    pub fn snapshot(&self, id: &str) -> Option<QueueRecord> {
        self.records().get(id).cloned()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, QueueRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RecordStore for InMemoryRecordStore {
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<QueueRecord>> {
        Box::pin(async move { Ok(self.snapshot(id)) })
    }

    fn save<'a>(&'a self, record: &'a QueueRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut record = record.clone();
            record.updated_at = Utc::now();
            self.insert(record);
            Ok(())
        })
    }

    fn reserve<'a>(
        &'a self,
        id: &'a str,
        expected: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut records = self.records();
            let record = records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if record.reserved_at != expected {
                return Ok(false);
            }

            record.reserve(at);
            Ok(true)
        })
    }

    fn record_failure<'a>(
        &'a self,
        id: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, QueueRecord> {
        Box::pin(async move {
            let mut records = self.records();
            let record = records
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            record.record_failure(at);
            Ok(record.clone())
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
    }

    fn list_due(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> StoreFuture<'_, Vec<QueueRecord>> {
        Box::pin(async move {
            let mut due: Vec<QueueRecord> = self
                .records()
                .values()
                .filter(|r| !r.is_reserved_within(now, window))
                .cloned()
                .collect();

            due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            due.truncate(limit);
            Ok(due)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DEFAULT_RESERVATION_WINDOW;
    use chrono::TimeDelta;
    use serde_json::json;

    #[tokio::test]
    async fn reserve_only_succeeds_against_expected_state() -> Result<(), StoreError> {
        let store = InMemoryRecordStore::new();
        let record = QueueRecord::new(json!({"type": "email"}));
        let id = record.id.clone();
        store.save(&record).await?;

        let now = Utc::now();
        assert!(store.reserve(&id, None, now).await?);
        // A second claimer that read the unreserved state loses.
        assert!(!store.reserve(&id, None, now).await?);

        let stored = store.get(&id).await?.ok_or(StoreError::NotFound(id.clone()))?;
        assert_eq!(stored.reserved_at, Some(now));
        Ok(())
    }

    #[tokio::test]
    async fn reserve_missing_record_is_not_found() {
        let store = InMemoryRecordStore::new();
        let result = store.reserve("missing", None, Utc::now()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn save_refreshes_updated_at() -> Result<(), StoreError> {
        let store = InMemoryRecordStore::new();
        let mut record = QueueRecord::new(json!({"type": "email"}));
        record.updated_at = Utc::now() - TimeDelta::hours(1);
        let before = Utc::now();
        store.save(&record).await?;

        let stored = store.get(&record.id).await?.ok_or(StoreError::NotFound(record.id.clone()))?;
        assert!(stored.updated_at >= before);
        assert_eq!(stored.created_at, record.created_at);
        Ok(())
    }

    #[tokio::test]
    async fn record_failure_counts_from_stored_state() -> Result<(), StoreError> {
        let store = InMemoryRecordStore::new();
        let record = QueueRecord::new(json!({"type": "email"})).with_attempts(3);
        store.save(&record).await?;
        store.reserve(&record.id, None, Utc::now()).await?;

        // The caller's copy still says attempts = 3; the store is the source of truth.
        let first = store.record_failure(&record.id, Utc::now()).await?;
        let second = store.record_failure(&record.id, Utc::now()).await?;
        assert_eq!(first.attempts, 4);
        assert_eq!(second.attempts, 5);
        assert!(second.reserved_at.is_none());

        let missing = store.record_failure("missing", Utc::now()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn delete_twice_fails_the_second_time() -> Result<(), StoreError> {
        let store = InMemoryRecordStore::new();
        let record = QueueRecord::new(json!({"type": "email"}));
        store.save(&record).await?;

        store.delete(&record.id).await?;
        assert!(store.is_empty());
        assert!(matches!(store.delete(&record.id).await, Err(StoreError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn list_due_skips_fresh_reservations() -> Result<(), StoreError> {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();

        let free = QueueRecord::new(json!({"type": "a"}));
        let stale = QueueRecord::new(json!({"type": "b"})).with_reservation(now - TimeDelta::minutes(10));
        let held = QueueRecord::new(json!({"type": "c"})).with_reservation(now);
        for record in [&free, &stale, &held] {
            store.save(record).await?;
        }

        let due = store.list_due(now, DEFAULT_RESERVATION_WINDOW, 10).await?;
        let ids: Vec<&str> = due.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(due.len(), 2);
        assert!(ids.contains(&free.id.as_str()));
        assert!(ids.contains(&stale.id.as_str()));

        let limited = store.list_due(now, DEFAULT_RESERVATION_WINDOW, 1).await?;
        assert_eq!(limited.len(), 1);
        Ok(())
    }
}
