//! Durable queue record stored in the job collection.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Name of the durable collection that holds queue records.
pub const QUEUE_COLLECTION: &str = "queues";

/// How long a reservation keeps other workers away from a record.
pub const DEFAULT_RESERVATION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// A persisted unit of work.
///
/// Producers create records; workers are the only writers afterwards. The
/// reservation is set when a worker claims the record and cleared again when
/// the attempt fails. A successful attempt deletes the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Unique identifier for this record.
    pub id: String,
    /// Collection the record was loaded from.
    pub collection: String,
    /// JSON document carrying the job type and its arguments.
    pub payload: String,
    /// Number of failed executions so far.
    #[serde(default)]
    pub attempts: u32,
    /// When a worker last claimed the record, if it is currently claimed.
    #[serde(default)]
    pub reserved_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl QueueRecord {
    /// Create a new unreserved record in the queue collection.
    pub fn new(payload: serde_json::Value) -> Self {
        Self::from_parts(Ulid::new().to_string(), QUEUE_COLLECTION, payload.to_string())
    }

    /// Build a record from raw parts, as a store hands them back.
    pub fn from_parts(
        id: impl Into<String>,
        collection: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            collection: collection.into(),
            payload: payload.into(),
            attempts: 0,
            reserved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the attempt counter.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the reservation timestamp.
    pub fn with_reservation(mut self, reserved_at: DateTime<Utc>) -> Self {
        self.reserved_at = Some(reserved_at);
        self
    }

    /// Check whether a reservation younger than `window` is held at `now`.
    pub fn is_reserved_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let Some(reserved_at) = self.reserved_at else {
            return false;
        };
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(reserved_at) < window
    }

    /// Mark the record as claimed at `now`.
    pub fn reserve(&mut self, now: DateTime<Utc>) {
        self.reserved_at = Some(now);
        self.updated_at = now;
    }

    /// Count a failed execution and release the reservation.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.reserved_at = None;
        self.updated_at = now;
    }
}
