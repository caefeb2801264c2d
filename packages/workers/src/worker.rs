//! Worker state machine for executing a single queue record.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use queue_core::{QueueRecord, RecordStore, parse_job_from_record, validate_record};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::Instrument;

use crate::context::JobContext;
use crate::error::JobError;
use crate::registry::HandlerRegistry;

/// Job channel shared by every worker in a pool.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Assignment>>>;

/// A record handed to a worker, tagged with the batch that submitted it.
#[derive(Debug)]
pub(crate) struct Assignment {
    pub(crate) batch: u64,
    pub(crate) record: QueueRecord,
}

/// A worker's result, tagged with the batch it belongs to.
#[derive(Debug)]
pub(crate) struct BatchResult {
    pub(crate) batch: u64,
    pub(crate) result: WorkerResult,
}

/// Where a worker is in processing its current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Validating,
    ReservationCheck,
    Reserving,
    Parsing,
    Dispatching,
    Completing,
    Failing,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Validating => "validating",
            WorkerState::ReservationCheck => "reservation_check",
            WorkerState::Reserving => "reserving",
            WorkerState::Parsing => "parsing",
            WorkerState::Dispatching => "dispatching",
            WorkerState::Completing => "completing",
            WorkerState::Failing => "failing",
        };
        f.write_str(name)
    }
}

/// Outcome of one record, as sent back to the pool.
#[derive(Debug)]
pub struct WorkerResult {
    pub job_id: String,
    pub outcome: Result<(), JobError>,
}

/// Executes queue records one at a time.
///
/// Each record is validated, reserved, parsed and dispatched to its handler.
/// A successful record is deleted from the store; a failed one has its stored
/// attempt counter bumped and its reservation cleared.
pub struct Worker {
    id: usize,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn RecordStore>,
    reservation_window: Duration,
    state: WorkerState,
}

impl Worker {
    /// Create a new idle worker.
    pub fn new(
        id: usize,
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn RecordStore>,
        reservation_window: Duration,
    ) -> Self {
        Self {
            id,
            registry,
            store,
            reservation_window,
            state: WorkerState::Idle,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run one record through the state machine.
    pub async fn process(&mut self, record: QueueRecord) -> WorkerResult {
        let job_id = record.id.clone();
        let outcome = self.execute(record).await;
        self.transition(WorkerState::Idle);
        WorkerResult { job_id, outcome }
    }

    async fn execute(&mut self, mut record: QueueRecord) -> Result<(), JobError> {
        self.transition(WorkerState::Validating);
        validate_record(Some(&record))?;

        self.transition(WorkerState::ReservationCheck);
        let now = Utc::now();
        if let Some(reserved_at) = record.reserved_at {
            if record.is_reserved_within(now, self.reservation_window) {
                tracing::warn!(
                    job_id = %record.id,
                    worker_id = self.id,
                    %reserved_at,
                    "Job is already reserved"
                );
                return Err(JobError::AlreadyReserved {
                    id: record.id,
                    reserved_at,
                });
            }
        }

        self.transition(WorkerState::Reserving);
        let claimed = self
            .store
            .reserve(&record.id, record.reserved_at, now)
            .await
            .map_err(JobError::Reservation)?;
        if !claimed {
            let reserved_at = match self.store.get(&record.id).await {
                Ok(Some(current)) => current.reserved_at.unwrap_or(now),
                _ => now,
            };
            tracing::warn!(
                job_id = %record.id,
                worker_id = self.id,
                "Lost reservation race"
            );
            return Err(JobError::AlreadyReserved {
                id: record.id,
                reserved_at,
            });
        }
        record.reserve(now);

        self.transition(WorkerState::Parsing);
        match self.dispatch(&record).await {
            Ok(()) => {
                self.transition(WorkerState::Completing);
                self.store
                    .delete(&record.id)
                    .await
                    .map_err(JobError::Completion)
            }
            Err(cause) => {
                self.transition(WorkerState::Failing);
                self.fail(record, cause).await
            }
        }
    }

    /// Parse the record and run its handler.
    async fn dispatch(&mut self, record: &QueueRecord) -> Result<(), JobError> {
        let job = parse_job_from_record(Some(record))?;

        self.transition(WorkerState::Dispatching);
        let handler = self
            .registry
            .get_handler(&job.job_type)
            .map_err(|_| JobError::HandlerNotFound(job.job_type.clone()))?;

        let ctx = JobContext::new(&job, self.id);
        let span = ctx.span().clone();
        let handler_ctx = ctx.clone();
        ctx.start();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(async move { handler.handle(handler_ctx, job).await })
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(())) => {
                ctx.end(started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                let err = JobError::Handler(e.to_string());
                ctx.error(&err);
                Err(err)
            }
            Err(panic) => {
                let message = extract_panic_message(&panic);
                tracing::error!(
                    job_id = %ctx.job_id(),
                    job_type = %ctx.job_type(),
                    worker_id = self.id,
                    "Handler panicked: {}",
                    message
                );
                Err(JobError::HandlerPanicked(message))
            }
        }
    }

    /// Count the failure against the stored record and release the reservation.
    async fn fail(&self, record: QueueRecord, cause: JobError) -> Result<(), JobError> {
        match self.store.record_failure(&record.id, Utc::now()).await {
            Ok(updated) => {
                tracing::info!(
                    job_id = %record.id,
                    worker_id = self.id,
                    attempts = updated.attempts,
                    "Job failed: {}",
                    cause
                );
                Err(cause)
            }
            Err(source) => {
                tracing::error!(
                    job_id = %record.id,
                    worker_id = self.id,
                    "Failed to persist job failure ({}): {}",
                    cause,
                    source
                );
                Err(JobError::FailurePersistence {
                    cause: cause.to_string(),
                    source,
                })
            }
        }
    }

    fn transition(&mut self, next: WorkerState) {
        tracing::debug!(worker_id = self.id, from = %self.state, to = %next, "Worker state");
        self.state = next;
    }

    /// Pull records off the shared channel until it closes or `stop` fires.
    pub(crate) async fn run(
        mut self,
        jobs: SharedReceiver,
        results: mpsc::Sender<BatchResult>,
        mut stop: watch::Receiver<bool>,
        busy: Arc<AtomicUsize>,
    ) {
        tracing::info!("Starting worker: {}", self.id);

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.changed() => None,
                record = async { jobs.lock().await.recv().await } => record,
            };
            let Some(Assignment { batch, record }) = next else {
                break;
            };

            busy.fetch_add(1, Ordering::SeqCst);
            let result = self.process(record).await;
            busy.fetch_sub(1, Ordering::SeqCst);

            if results.send(BatchResult { batch, result }).await.is_err() {
                tracing::debug!(worker_id = self.id, "Result receiver dropped");
            }
        }

        tracing::info!("Worker stopped: {}", self.id);
    }
}

fn extract_panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_handler;
    use chrono::TimeDelta;
    use queue_core::{InMemoryRecordStore, ValidationError};
    use serde_json::json;
    use std::error::Error;

    fn worker_with(store: Arc<InMemoryRecordStore>, registry: HandlerRegistry) -> Worker {
        Worker::new(
            0,
            Arc::new(registry),
            store,
            queue_core::DEFAULT_RESERVATION_WINDOW,
        )
    }

    #[tokio::test]
    async fn success_deletes_record() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = HandlerRegistry::new();
        registry.register(job_handler!("email", |_ctx, _job| Ok(())))?;

        let record = QueueRecord::new(json!({"type": "email"}));
        store.insert(record.clone());

        let mut worker = worker_with(store.clone(), registry);
        let result = worker.process(record.clone()).await;

        assert_eq!(result.job_id, record.id);
        assert!(result.outcome.is_ok());
        assert!(store.snapshot(&record.id).is_none());
        assert_eq!(worker.state(), WorkerState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn validation_failure_touches_nothing() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let record = QueueRecord::from_parts("", queue_core::QUEUE_COLLECTION, "{}");

        let mut worker = worker_with(store.clone(), HandlerRegistry::new());
        let result = worker.process(record).await;

        assert!(matches!(
            result.outcome,
            Err(JobError::Validation(ValidationError::MissingId))
        ));
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn fresh_reservation_is_a_conflict() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let reserved_at = Utc::now() - TimeDelta::seconds(30);
        let record = QueueRecord::new(json!({"type": "email"})).with_reservation(reserved_at);
        store.insert(record.clone());

        let mut worker = worker_with(store.clone(), HandlerRegistry::new());
        let result = worker.process(record.clone()).await;

        match result.outcome {
            Err(JobError::AlreadyReserved { id, reserved_at: at }) => {
                assert_eq!(id, record.id);
                assert_eq!(at, reserved_at);
            }
            other => return Err(format!("unexpected outcome: {other:?}").into()),
        }
        let stored = store.snapshot(&record.id).ok_or("record missing")?;
        assert_eq!(stored.attempts, 0);
        assert_eq!(stored.reserved_at, Some(reserved_at));
        Ok(())
    }

    #[tokio::test]
    async fn stale_reservation_is_reclaimed() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = HandlerRegistry::new();
        registry.register(job_handler!("email", |_ctx, _job| Ok(())))?;

        let record = QueueRecord::new(json!({"type": "email"}))
            .with_reservation(Utc::now() - TimeDelta::minutes(10));
        store.insert(record.clone());

        let mut worker = worker_with(store.clone(), registry);
        assert!(worker.process(record.clone()).await.outcome.is_ok());
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_type_fails_and_counts_attempt() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let record = QueueRecord::new(json!({"type": "fax"}));
        store.insert(record.clone());

        let mut worker = worker_with(store.clone(), HandlerRegistry::new());
        let result = worker.process(record.clone()).await;

        assert!(matches!(result.outcome, Err(JobError::HandlerNotFound(ref t)) if t == "fax"));
        let stored = store.snapshot(&record.id).ok_or("record missing")?;
        assert_eq!(stored.attempts, 1);
        assert!(stored.reserved_at.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn bad_payload_fails_and_counts_attempt() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let record = QueueRecord::from_parts("job-1", queue_core::QUEUE_COLLECTION, "not json");
        store.insert(record.clone());

        let mut worker = worker_with(store.clone(), HandlerRegistry::new());
        let result = worker.process(record).await;

        assert!(matches!(result.outcome, Err(JobError::Parse(_))));
        assert_eq!(store.snapshot("job-1").ok_or("record missing")?.attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn panic_becomes_error() -> Result<(), Box<dyn Error>> {
        let store = Arc::new(InMemoryRecordStore::new());
        let registry = HandlerRegistry::new();
        registry.register(job_handler!("explode", |_ctx, _job| {
            panic!("kaboom");
        }))?;

        let record = QueueRecord::new(json!({"type": "explode"}));
        store.insert(record.clone());

        let mut worker = worker_with(store.clone(), registry);
        let result = worker.process(record.clone()).await;

        match result.outcome {
            Err(JobError::HandlerPanicked(msg)) => assert!(msg.contains("kaboom")),
            other => return Err(format!("unexpected outcome: {other:?}").into()),
        }
        let stored = store.snapshot(&record.id).ok_or("record missing")?;
        assert_eq!(stored.attempts, 1);
        assert!(stored.reserved_at.is_none());
        Ok(())
    }

    #[test]
    fn panic_payloads_are_readable() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("borrowed");
        let other: Box<dyn std::any::Any + Send> = Box::new(42_u8);

        assert_eq!(extract_panic_message(&owned), "owned");
        assert_eq!(extract_panic_message(&borrowed), "borrowed");
        assert_eq!(extract_panic_message(&other), "unknown panic");
    }

    #[test]
    fn state_names() {
        assert_eq!(WorkerState::ReservationCheck.to_string(), "reservation_check");
        assert_eq!(WorkerState::Idle.to_string(), "idle");
    }
}
