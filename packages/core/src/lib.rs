//! Core domain types for the job processing engine.
//!
//! This crate contains the types shared by every other package:
//! - `QueueRecord`, the durable representation of one unit of work
//! - `ParsedJob`, the handler-facing view derived from a record
//! - `RecordStore`, the persistence seam workers write through

mod job;
mod record;
mod store;

pub use job::{JobParseError, ParseError, ParsedJob, ValidationError, parse_job_from_record, validate_record};
pub use record::{DEFAULT_RESERVATION_WINDOW, QUEUE_COLLECTION, QueueRecord};
pub use store::{InMemoryRecordStore, RecordStore, StoreError, StoreFuture};
