//! Handler-facing job view and record parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::{QUEUE_COLLECTION, QueueRecord};

/// Structural problems that make a record unusable before any work starts.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("queue record is missing")]
    MissingRecord,

    #[error("queue record has no identifier")]
    MissingId,

    #[error("record belongs to collection '{found}', expected '{expected}'")]
    WrongCollection {
        expected: &'static str,
        found: String,
    },
}

/// The record's payload could not be turned into a job.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("payload has no job type")]
    MissingType,
}

/// Either failure mode of [`parse_job_from_record`].
#[derive(Debug, Error)]
pub enum JobParseError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// The view of a queue record handed to handlers.
///
/// Built fresh for every execution attempt and never written back; workers
/// persist changes through the [`QueueRecord`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedJob {
    pub id: String,
    /// Display name, taken from the payload's `name` or the job type.
    pub name: String,
    pub description: String,
    /// Type used to route the job to its handler.
    pub job_type: String,
    /// The full decoded payload object.
    pub payload: Map<String, Value>,
    pub attempts: u32,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParsedJob {
    /// Get a payload field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Get a string payload field by key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Check that a record is present, identified, and from the queue collection.
pub fn validate_record(record: Option<&QueueRecord>) -> Result<&QueueRecord, ValidationError> {
    let record = record.ok_or(ValidationError::MissingRecord)?;

    if record.id.trim().is_empty() {
        return Err(ValidationError::MissingId);
    }

    if record.collection != QUEUE_COLLECTION {
        return Err(ValidationError::WrongCollection {
            expected: QUEUE_COLLECTION,
            found: record.collection.clone(),
        });
    }

    Ok(record)
}

/// Derive the handler-facing view of a queue record.
pub fn parse_job_from_record(record: Option<&QueueRecord>) -> Result<ParsedJob, JobParseError> {
    let record = validate_record(record)?;

    let payload = match serde_json::from_str::<Value>(&record.payload).map_err(ParseError::from)? {
        Value::Object(map) => map,
        _ => return Err(ParseError::NotAnObject.into()),
    };

    let job_type = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ParseError::MissingType)?
        .to_string();

    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(job_type.as_str())
        .to_string();

    let description = payload
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(ParsedJob {
        id: record.id.clone(),
        name,
        description,
        job_type,
        payload,
        attempts: record.attempts,
        reserved_at: record.reserved_at,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_type_name_and_payload() -> Result<(), JobParseError> {
        let record = QueueRecord::new(json!({
            "type": "email",
            "name": "Welcome email",
            "to": "someone@example.com",
        }))
        .with_attempts(1);

        let job = parse_job_from_record(Some(&record))?;

        assert_eq!(job.id, record.id);
        assert_eq!(job.job_type, "email");
        assert_eq!(job.name, "Welcome email");
        assert_eq!(job.description, "");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.get_str("to"), Some("someone@example.com"));
        Ok(())
    }

    #[test]
    fn name_falls_back_to_type() -> Result<(), JobParseError> {
        let record = QueueRecord::new(json!({"type": "export", "description": "nightly"}));
        let job = parse_job_from_record(Some(&record))?;

        assert_eq!(job.name, "export");
        assert_eq!(job.description, "nightly");
        Ok(())
    }

    #[test]
    fn rejects_missing_record() {
        let err = parse_job_from_record(None).unwrap_err();
        assert!(matches!(err, JobParseError::Validation(ValidationError::MissingRecord)));
    }

    #[test]
    fn rejects_empty_id() {
        let record = QueueRecord::from_parts("", QUEUE_COLLECTION, r#"{"type":"email"}"#);
        let err = parse_job_from_record(Some(&record)).unwrap_err();
        assert!(matches!(err, JobParseError::Validation(ValidationError::MissingId)));
    }

    #[test]
    fn rejects_foreign_collection() {
        let record = QueueRecord::from_parts("abc", "users", r#"{"type":"email"}"#);
        let err = parse_job_from_record(Some(&record)).unwrap_err();
        assert!(matches!(
            err,
            JobParseError::Validation(ValidationError::WrongCollection { .. })
        ));
    }

    #[test]
    fn rejects_undecodable_payload() {
        let record = QueueRecord::from_parts("abc", QUEUE_COLLECTION, "{not json");
        let err = parse_job_from_record(Some(&record)).unwrap_err();
        assert!(matches!(err, JobParseError::Parse(ParseError::InvalidPayload(_))));

        let record = QueueRecord::from_parts("abc", QUEUE_COLLECTION, "[1, 2, 3]");
        let err = parse_job_from_record(Some(&record)).unwrap_err();
        assert!(matches!(err, JobParseError::Parse(ParseError::NotAnObject)));
    }

    #[test]
    fn rejects_blank_type() {
        for payload in [json!({}), json!({"type": ""}), json!({"type": "  "}), json!({"type": 7})] {
            let record = QueueRecord::new(payload);
            let err = parse_job_from_record(Some(&record)).unwrap_err();
            assert!(matches!(err, JobParseError::Parse(ParseError::MissingType)));
        }
    }
}
