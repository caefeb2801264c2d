//! Top-level processor binding a registry, a pool and a store.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::Utc;
use queue_core::{QueueRecord, RecordStore};

use crate::config::ProcessorConfig;
use crate::error::ProcessorError;
use crate::handler::JobHandler;
use crate::pool::{JobOutcome, PoolStats, WorkerPool};
use crate::registry::HandlerRegistry;

/// Job processor: registers handlers and runs queue records through a pool.
pub struct Processor {
    config: ProcessorConfig,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn RecordStore>,
    pool: WorkerPool,
}

impl Processor {
    /// Create a processor and start its workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ProcessorConfig, store: Arc<dyn RecordStore>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let pool = WorkerPool::new(registry.clone(), store.clone(), &config);

        Self {
            config,
            registry,
            store,
            pool,
        }
    }

    /// Register a handler. Handlers can be added while the pool runs.
    pub fn register<H: JobHandler>(&self, handler: H) -> Result<(), ProcessorError> {
        Ok(self.registry.register(handler)?)
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run a batch of records, returning one outcome per record in order.
    pub async fn process_jobs(&self, records: Vec<QueueRecord>) -> Vec<JobOutcome> {
        self.pool.process_jobs(records).await
    }

    /// Fetch up to `limit` due records from the store and run them.
    pub async fn process_due(&self, limit: usize) -> Result<Vec<JobOutcome>, ProcessorError> {
        let due = self
            .store
            .list_due(Utc::now(), self.config.reservation_window(), limit)
            .await?;

        if due.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!("Processing {} due job(s)", due.len());
        Ok(self.pool.process_jobs(due).await)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shut the pool down. See [`WorkerPool::shutdown`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ProcessorError> {
        Ok(self.pool.shutdown(timeout).await?)
    }
}

/// Owner of the one processor an application runs.
///
/// Starting twice hands back the running instance.
#[derive(Default)]
pub struct ProcessorHost {
    processor: std::sync::Mutex<Option<Arc<Processor>>>,
}

impl ProcessorHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the processor, or return it if already started.
    pub fn start(&self, config: ProcessorConfig, store: Arc<dyn RecordStore>) -> Arc<Processor> {
        let mut slot = self.processor.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            tracing::debug!("Processor already started");
            return existing.clone();
        }

        tracing::info!("Starting processor with {} workers", config.worker_count());
        let processor = Arc::new(Processor::new(config, store));
        *slot = Some(processor.clone());
        processor
    }

    /// The running processor.
    pub fn get(&self) -> Result<Arc<Processor>, ProcessorError> {
        self.processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProcessorError::NotInitialized)
    }

    /// Shut the processor down and forget it. A later `start` creates a new one.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ProcessorError> {
        let processor = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match processor {
            Some(processor) => processor.shutdown(timeout).await,
            None => Ok(()),
        }
    }
}
