//! Per-attempt execution context handed to handlers.

use std::fmt::Display;
use std::time::Duration;

use queue_core::ParsedJob;
use tracing::Span;

/// Context for one execution attempt of one job.
///
/// Every event is emitted inside a span carrying the job id, so handler logs
/// can be correlated with the worker's own.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: String,
    job_type: String,
    worker_id: usize,
    attempt: u32,
    span: Span,
}

impl JobContext {
    /// Build the context for an attempt of `job` on worker `worker_id`.
    pub fn new(job: &ParsedJob, worker_id: usize) -> Self {
        let attempt = job.attempts.saturating_add(1);
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            worker_id,
            attempt
        );
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            worker_id,
            attempt,
            span,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// One-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span the attempt runs in.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Record that the attempt started.
    pub fn start(&self) {
        self.span.in_scope(|| tracing::info!("Job started"));
    }

    /// Emit a handler debug message.
    pub fn debug(&self, msg: &str) {
        self.span.in_scope(|| tracing::debug!("{}", msg));
    }

    /// Record that the attempt finished successfully.
    pub fn end(&self, elapsed: Duration) {
        self.span.in_scope(|| {
            tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "Job completed")
        });
    }

    /// Record that the attempt failed.
    pub fn error(&self, err: &dyn Display) {
        self.span
            .in_scope(|| tracing::warn!(error = %err, "Job failed"));
    }
}
