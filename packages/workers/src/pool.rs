//! Fixed-size pool of workers fed from one job channel.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use queue_core::{QueueRecord, RecordStore};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ProcessorConfig;
use crate::error::{JobError, ShutdownError};
use crate::registry::HandlerRegistry;
use crate::worker::{Assignment, BatchResult, Worker, WorkerResult};

/// Result of one record in a batch, in the caller's order.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub result: Result<(), JobError>,
}

impl JobOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Point-in-time view of a pool, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy_workers: usize,
    pub job_capacity: usize,
    pub queued_jobs: usize,
    pub result_capacity: usize,
    pub pending_results: usize,
    pub closed: bool,
}

/// A fixed set of workers sharing one job channel and one result channel.
///
/// Batches are processed one at a time; callers submitting concurrently wait
/// their turn.
pub struct WorkerPool {
    workers: usize,
    enqueue_timeout: Duration,
    result_timeout: Duration,
    job_tx: std::sync::Mutex<Option<mpsc::Sender<Assignment>>>,
    result_tx: mpsc::Sender<BatchResult>,
    results: Mutex<mpsc::Receiver<BatchResult>>,
    next_batch: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start a pool. Must be called from within a Tokio runtime.
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn RecordStore>,
        config: &ProcessorConfig,
    ) -> Self {
        let workers = config.worker_count();
        let capacity = workers * 2;

        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);
        let (stop_tx, _) = watch::channel(false);
        let busy = Arc::new(AtomicUsize::new(0));
        let jobs = Arc::new(Mutex::new(job_rx));

        let handles = (0..workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    registry.clone(),
                    store.clone(),
                    config.reservation_window(),
                );
                tokio::spawn(worker.run(
                    jobs.clone(),
                    result_tx.clone(),
                    stop_tx.subscribe(),
                    busy.clone(),
                ))
            })
            .collect();

        tracing::info!(workers, capacity, "Worker pool started");

        Self {
            workers,
            enqueue_timeout: config.enqueue_timeout(),
            result_timeout: config.result_timeout(),
            job_tx: std::sync::Mutex::new(Some(job_tx)),
            result_tx,
            results: Mutex::new(result_rx),
            handles: Mutex::new(handles),
            stop_tx,
            busy,
            next_batch: AtomicU64::new(0),
        }
    }

    /// Number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run a batch of records and return one outcome per record, in order.
    ///
    /// Records are enqueued while results are collected, so batches larger
    /// than the channel capacity make progress. A record that cannot be
    /// enqueued in time gets [`JobError::EnqueueTimeout`]; a wait for a
    /// result that runs out assigns [`JobError::ResultTimeout`] to the
    /// earliest record still pending. The handler itself keeps running.
    pub async fn process_jobs(&self, records: Vec<QueueRecord>) -> Vec<JobOutcome> {
        if records.is_empty() {
            return Vec::new();
        }

        let mut results = self.results.lock().await;
        let batch = self.next_batch.fetch_add(1, Ordering::SeqCst);

        let Some(job_tx) = self.sender() else {
            return records
                .into_iter()
                .map(|record| JobOutcome {
                    job_id: record.id,
                    result: Err(JobError::PoolClosed),
                })
                .collect();
        };

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let mut pending: HashMap<&str, VecDeque<usize>> = HashMap::new();
        for (index, id) in ids.iter().enumerate() {
            pending.entry(id.as_str()).or_default().push_back(index);
        }
        let mut slots: Vec<Option<Result<(), JobError>>> = (0..ids.len()).map(|_| None).collect();
        let mut remaining = ids.len();

        let feeder = tokio::spawn(enqueue_all(
            batch,
            records,
            job_tx,
            self.result_tx.clone(),
            self.enqueue_timeout,
        ));

        while remaining > 0 {
            match tokio::time::timeout(self.result_timeout, results.recv()).await {
                Ok(Some(BatchResult { batch: from, result })) if from != batch => {
                    tracing::debug!(
                        job_id = %result.job_id,
                        batch = from,
                        "Discarding result from an earlier batch"
                    );
                }
                Ok(Some(BatchResult { result, .. })) => {
                    let slot = pending
                        .get_mut(result.job_id.as_str())
                        .and_then(VecDeque::pop_front);
                    match slot {
                        Some(index) => {
                            slots[index] = Some(result.outcome);
                            remaining -= 1;
                        }
                        None => {
                            tracing::warn!(job_id = %result.job_id, "Result for a job that is not pending");
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let Some(index) = slots.iter().position(Option::is_none) else {
                        break;
                    };
                    tracing::warn!(job_id = %ids[index], "Timed out waiting for job result");
                    if let Some(queue) = pending.get_mut(ids[index].as_str()) {
                        queue.retain(|&i| i != index);
                    }
                    slots[index] = Some(Err(JobError::ResultTimeout));
                    remaining -= 1;
                }
            }
        }

        feeder.abort();

        ids.iter()
            .zip(slots)
            .map(|(id, slot)| JobOutcome {
                job_id: id.clone(),
                result: slot.unwrap_or(Err(JobError::PoolClosed)),
            })
            .collect()
    }

    /// Stop accepting work and wait for workers to finish.
    ///
    /// When `timeout` elapses first the workers are told to exit at their
    /// next channel read. That is only an error if a job was still running.
    /// Calling this again after the pool stopped returns `Ok`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        drop(
            self.job_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let handles = std::mem::take(&mut *self.handles.lock().await);
        if handles.is_empty() {
            return Ok(());
        }

        tracing::info!("Shutting down worker pool ({} workers)", handles.len());

        match tokio::time::timeout(timeout, futures_util::future::join_all(handles)).await {
            Ok(_) => {
                tracing::info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                self.stop_tx.send_replace(true);
                let busy = self.busy.load(Ordering::SeqCst);
                if busy == 0 {
                    tracing::info!("Worker pool stopped after deadline with no jobs running");
                    Ok(())
                } else {
                    tracing::warn!(busy, "Shutdown deadline exceeded with jobs still running");
                    Err(ShutdownError::DeadlineExceeded { busy })
                }
            }
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Current channel occupancy and worker activity.
    pub fn stats(&self) -> PoolStats {
        let sender = self.sender();
        let job_capacity = self.workers * 2;
        let queued_jobs = sender
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);

        PoolStats {
            workers: self.workers,
            busy_workers: self.busy.load(Ordering::SeqCst),
            job_capacity,
            queued_jobs,
            result_capacity: self.result_tx.max_capacity(),
            pending_results: self.result_tx.max_capacity() - self.result_tx.capacity(),
            closed: sender.is_none(),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Assignment>> {
        self.job_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Push every record onto the job channel, reporting the ones that never
/// made it through the result channel.
async fn enqueue_all(
    batch: u64,
    records: Vec<QueueRecord>,
    job_tx: mpsc::Sender<Assignment>,
    result_tx: mpsc::Sender<BatchResult>,
    timeout: Duration,
) {
    for record in records {
        let job_id = record.id.clone();
        let assignment = Assignment { batch, record };
        let outcome = match tokio::time::timeout(timeout, job_tx.send(assignment)).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => Err(JobError::PoolClosed),
            Err(_) => {
                tracing::warn!(job_id = %job_id, "Timed out enqueueing job");
                Err(JobError::EnqueueTimeout)
            }
        };

        let result = WorkerResult { job_id, outcome };
        if result_tx.send(BatchResult { batch, result }).await.is_err() {
            break;
        }
    }
}
