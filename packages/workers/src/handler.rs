//! Job handler trait and closure adapter.

use std::error::Error;
use std::future::Future;
use std::pin::Pin;

use queue_core::ParsedJob;

use crate::context::JobContext;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Result type for job handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific type are processed.
/// Handlers run to completion; the pool never cancels them, so long-running
/// work should bound itself.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler processes.
    fn job_type(&self) -> &str;

    /// Process a job.
    fn handle(&self, ctx: JobContext, job: ParsedJob) -> HandlerFuture;
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(JobContext, ParsedJob) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(JobContext, ParsedJob) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(job_type: impl Into<String>, handler: F) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, ParsedJob) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn handle(&self, ctx: JobContext, job: ParsedJob) -> HandlerFuture {
        (self.handler)(ctx, job)
    }
}

/// Helper macro for creating job handlers from async bodies.
///
/// ```ignore
/// let echo = job_handler!("echo", |ctx, job| {
///     ctx.debug(&format!("echo: {:?}", job.payload));
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$ctx:ident, $job:ident| $body:expr) => {
        $crate::FnHandler::new(
            $job_type,
            |$ctx: $crate::JobContext, $job: $crate::ParsedJob| -> $crate::HandlerFuture {
                Box::pin(async move {
                    let result: $crate::HandlerResult = $body;
                    result
                })
            },
        )
    };
}
