//! Worker pool and processor for the job queue.
//!
//! # Architecture
//!
//! - `HandlerRegistry` - Maps job types to handlers
//! - `Worker` - Runs one queue record at a time through reservation,
//!   dispatch and completion
//! - `WorkerPool` - Fixed set of workers fed from a shared channel
//! - `Processor` - Binds a registry, a pool and a record store
//!
//! # Usage
//!
//! ```ignore
//! use workers::{Processor, ProcessorConfig, job_handler};
//!
//! let processor = Processor::new(ProcessorConfig::default(), store);
//! processor.register(job_handler!("echo", |ctx, job| {
//!     ctx.debug(&format!("payload: {:?}", job.payload));
//!     Ok(())
//! }))?;
//!
//! let outcomes = processor.process_jobs(records).await;
//! ```

mod config;
mod context;
mod error;
mod handler;
mod pool;
mod processor;
mod registry;
mod worker;

pub use config::{DEFAULT_WORKERS, ProcessorConfig};
pub use context::JobContext;
pub use error::{ConfigError, JobError, ProcessorError, RegistryError, ShutdownError};
pub use handler::{FnHandler, HandlerError, HandlerFuture, HandlerResult, JobHandler};
pub use pool::{JobOutcome, PoolStats, WorkerPool};
pub use processor::{Processor, ProcessorHost};
pub use registry::HandlerRegistry;
pub use worker::{Worker, WorkerResult, WorkerState};

pub use queue_core::ParsedJob;
