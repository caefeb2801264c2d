//! Processor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Worker count used when zero workers are requested.
pub const DEFAULT_WORKERS: usize = 5;

/// Configuration for the worker pool and processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long a reservation keeps other workers away from a record.
    pub reservation_window_secs: u64,
    /// How long a batch waits for room in the job channel.
    pub enqueue_timeout_secs: u64,
    /// How long a batch waits for each result.
    pub result_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            reservation_window_secs: 300,
            enqueue_timeout_secs: 30,
            result_timeout_secs: 300,
        }
    }
}

impl ProcessorConfig {
    /// Set the number of workers. Zero falls back to the default.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the reservation window, rounded up to whole seconds.
    pub fn with_reservation_window(mut self, window: Duration) -> Self {
        self.reservation_window_secs = whole_secs(window);
        self
    }

    /// Set the enqueue timeout, rounded up to whole seconds.
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout_secs = whole_secs(timeout);
        self
    }

    /// Set the per-result timeout, rounded up to whole seconds.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout_secs = whole_secs(timeout);
        self
    }

    /// Worker count with the zero fallback applied.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            DEFAULT_WORKERS
        } else {
            self.workers
        }
    }

    pub fn reservation_window(&self) -> Duration {
        Duration::from_secs(self.reservation_window_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_secs(self.enqueue_timeout_secs)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    /// Build a config from environment variables.
    ///
    /// - `JOBS_WORKER_COUNT` (default: 5)
    /// - `JOBS_RESERVATION_WINDOW_SECS` (default: 300)
    /// - `JOBS_ENQUEUE_TIMEOUT_SECS` (default: 30)
    /// - `JOBS_RESULT_TIMEOUT_SECS` (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            workers: parse_or(&lookup, "JOBS_WORKER_COUNT", defaults.workers)?,
            reservation_window_secs: parse_or(
                &lookup,
                "JOBS_RESERVATION_WINDOW_SECS",
                defaults.reservation_window_secs,
            )?,
            enqueue_timeout_secs: parse_or(
                &lookup,
                "JOBS_ENQUEUE_TIMEOUT_SECS",
                defaults.enqueue_timeout_secs,
            )?,
            result_timeout_secs: parse_or(
                &lookup,
                "JOBS_RESULT_TIMEOUT_SECS",
                defaults.result_timeout_secs,
            )?,
        })
    }
}

/// Seconds in `duration`, counting any fraction as a full second.
fn whole_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(default);
    }
    trimmed.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}
