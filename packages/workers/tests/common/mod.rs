//! Shared test helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{InMemoryRecordStore, QueueRecord, RecordStore, StoreError, StoreFuture};
use workers::{HandlerRegistry, ProcessorConfig, WorkerPool};

/// In-memory store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryRecordStore,
    pub fail_saves: AtomicBool,
    pub fail_deletes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self) {
        self.fail_saves.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }
}

impl RecordStore for FlakyStore {
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<QueueRecord>> {
        self.inner.get(id)
    }

    fn save<'a>(&'a self, record: &'a QueueRecord) -> StoreFuture<'a, ()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Box::pin(async { Err(StoreError::Backend("disk full".into())) });
        }
        self.inner.save(record)
    }

    fn reserve<'a>(
        &'a self,
        id: &'a str,
        expected: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        self.inner.reserve(id, expected, at)
    }

    fn record_failure<'a>(&'a self, id: &'a str, at: DateTime<Utc>) -> StoreFuture<'a, QueueRecord> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Box::pin(async { Err(StoreError::Backend("disk full".into())) });
        }
        self.inner.record_failure(id, at)
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Box::pin(async { Err(StoreError::Backend("connection reset".into())) });
        }
        self.inner.delete(id)
    }

    fn list_due(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> StoreFuture<'_, Vec<QueueRecord>> {
        self.inner.list_due(now, window, limit)
    }
}

/// Start a pool over `store` with `workers` workers.
pub fn start_pool(
    workers: usize,
    registry: HandlerRegistry,
    store: Arc<dyn RecordStore>,
) -> (WorkerPool, Arc<HandlerRegistry>) {
    let registry = Arc::new(registry);
    let config = ProcessorConfig::default().with_workers(workers);
    (WorkerPool::new(registry.clone(), store, &config), registry)
}
