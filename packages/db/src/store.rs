//! SurrealDB-backed queue record store.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use queue_core::{QUEUE_COLLECTION, QueueRecord, RecordStore, StoreError, StoreFuture};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError, init_schema};

/// Record as stored in SurrealDB.
///
/// Timestamps are kept as microseconds so they sort correctly; the
/// reservation is a string that is either empty or an RFC 3339 instant.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    payload: String,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    reserved_at: String,
    #[serde(with = "chrono::serde::ts_microseconds")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    updated_at: DateTime<Utc>,
}

/// Stored record plus its raw record key, as returned by listing queries.
#[derive(Debug, Deserialize)]
struct ListedRecord {
    key: String,
    payload: String,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    reserved_at: String,
    #[serde(with = "chrono::serde::ts_microseconds")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_microseconds")]
    updated_at: DateTime<Utc>,
}

impl ListedRecord {
    fn into_record(self, collection: &str) -> Result<QueueRecord, DbError> {
        let stored = StoredRecord {
            payload: self.payload,
            attempts: self.attempts,
            reserved_at: self.reserved_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        stored.into_record(self.key, collection)
    }
}

impl StoredRecord {
    fn from_record(record: &QueueRecord) -> Self {
        Self {
            payload: record.payload.clone(),
            attempts: record.attempts,
            reserved_at: format_reservation(record.reserved_at),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_record(self, id: String, collection: &str) -> Result<QueueRecord, DbError> {
        Ok(QueueRecord {
            id,
            collection: collection.to_string(),
            payload: self.payload,
            attempts: self.attempts,
            reserved_at: parse_reservation(&self.reserved_at)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Format a reservation with a fixed width so stored values compare as strings.
fn format_reservation(reserved_at: Option<DateTime<Utc>>) -> String {
    reserved_at
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_default()
}

fn parse_reservation(raw: &str) -> Result<Option<DateTime<Utc>>, DbError> {
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|at| Some(at.with_timezone(&Utc)))
        .map_err(|e| DbError::Serialization(format!("invalid reservation timestamp {raw:?}: {e}")))
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(id) => StoreError::NotFound(id),
            DbError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Queue record store persisted in a SurrealDB table.
#[derive(Debug, Clone)]
pub struct SurrealRecordStore {
    db: Database,
    table: String,
}

impl SurrealRecordStore {
    /// Open the store on the default queue table, creating its schema.
    pub async fn new(db: Database) -> Result<Self, DbError> {
        Self::with_table(db, QUEUE_COLLECTION).await
    }

    /// Open the store on a specific table, creating its schema.
    ///
    /// Records loaded from a table other than the queue collection fail
    /// validation in the worker.
    pub async fn with_table(db: Database, table: impl Into<String>) -> Result<Self, DbError> {
        let table = table.into();
        init_schema(&db, &table).await?;
        Ok(Self { db, table })
    }

    /// Table this store reads and writes.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Load a record by ID.
    pub async fn find(&self, id: &str) -> Result<Option<QueueRecord>, DbError> {
        let stored: Option<StoredRecord> = self
            .db
            .select((self.table.clone(), id.to_string()))
            .await?;

        stored
            .map(|s| s.into_record(id.to_string(), &self.table))
            .transpose()
    }

    /// Insert or replace a record.
    pub async fn upsert(&self, record: &QueueRecord) -> Result<(), DbError> {
        let mut stored = StoredRecord::from_record(record);
        stored.updated_at = Utc::now();

        let written: Option<StoredRecord> = self
            .db
            .upsert((self.table.clone(), record.id.clone()))
            .content(stored)
            .await?;

        written
            .map(|_| ())
            .ok_or_else(|| DbError::Query(format!("Failed to save record {}", record.id)))
    }

    /// Atomically move the reservation from `expected` to `at`.
    pub async fn compare_and_reserve(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing($table, $id)
                SET reserved_at = $at, updated_at = $now
                WHERE reserved_at = $expected
                RETURN AFTER
                "#,
            )
            .bind(("table", self.table.clone()))
            .bind(("id", id.to_string()))
            .bind(("at", format_reservation(Some(at))))
            .bind(("now", Utc::now().timestamp_micros()))
            .bind(("expected", format_reservation(expected)))
            .await?;

        let updated: Vec<StoredRecord> = response.take(0)?;
        if !updated.is_empty() {
            return Ok(true);
        }

        // Nothing matched: either the reservation moved or the record is gone.
        match self.find(id).await? {
            Some(_) => Ok(false),
            None => Err(DbError::NotFound(id.to_string())),
        }
    }

    /// Bump the stored attempt counter and clear the reservation in one statement.
    pub async fn count_failure(&self, id: &str, at: DateTime<Utc>) -> Result<QueueRecord, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing($table, $id)
                SET attempts += 1, reserved_at = "", updated_at = $now
                RETURN AFTER
                "#,
            )
            .bind(("table", self.table.clone()))
            .bind(("id", id.to_string()))
            .bind(("now", at.timestamp_micros()))
            .await?;

        let updated: Vec<StoredRecord> = response.take(0)?;
        match updated.into_iter().next() {
            Some(stored) => stored.into_record(id.to_string(), &self.table),
            None => Err(DbError::NotFound(id.to_string())),
        }
    }

    /// Delete a record, failing when it does not exist.
    pub async fn remove(&self, id: &str) -> Result<(), DbError> {
        let deleted: Option<StoredRecord> = self
            .db
            .delete((self.table.clone(), id.to_string()))
            .await?;

        deleted
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(id.to_string()))
    }

    /// Records whose reservation is empty or older than `window`, oldest first.
    pub async fn due(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<QueueRecord>, DbError> {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut response = self
            .db
            .query(
                r#"
                SELECT *, meta::id(id) AS key FROM type::table($table)
                WHERE reserved_at = "" OR reserved_at <= $cutoff
                ORDER BY created_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("table", self.table.clone()))
            .bind(("cutoff", format_reservation(Some(cutoff))))
            .bind(("limit", limit as i64))
            .await?;

        let rows: Vec<ListedRecord> = response.take(0)?;

        rows.into_iter()
            .map(|row| row.into_record(&self.table))
            .collect()
    }
}

impl RecordStore for SurrealRecordStore {
    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<QueueRecord>> {
        Box::pin(async move { Ok(self.find(id).await?) })
    }

    fn save<'a>(&'a self, record: &'a QueueRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move { Ok(self.upsert(record).await?) })
    }

    fn reserve<'a>(
        &'a self,
        id: &'a str,
        expected: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.compare_and_reserve(id, expected, at).await?) })
    }

    fn record_failure<'a>(
        &'a self,
        id: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, QueueRecord> {
        Box::pin(async move { Ok(self.count_failure(id, at).await?) })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move { Ok(self.remove(id).await?) })
    }

    fn list_due(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> StoreFuture<'_, Vec<QueueRecord>> {
        Box::pin(async move { Ok(self.due(now, window, limit).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_strings_have_fixed_width() -> Result<(), DbError> {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .map_err(|e| DbError::Serialization(e.to_string()))?
            .with_timezone(&Utc);

        let formatted = format_reservation(Some(at));
        assert_eq!(formatted, "2024-05-01T10:00:00.000000Z");
        assert_eq!(parse_reservation(&formatted)?, Some(at));
        assert_eq!(format_reservation(None), "");
        assert_eq!(parse_reservation("")?, None);
        Ok(())
    }

    #[test]
    fn garbage_reservation_is_a_serialization_error() {
        assert!(matches!(
            parse_reservation("yesterday"),
            Err(DbError::Serialization(_))
        ));
    }
}
