//! Failed job rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;

/// Default retry budget for a failed job.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// One row of `failed_job`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: i64,
    /// Handler family, e.g. "tournament" or "team".
    pub job_type: String,
    pub source: String,
    pub external_id: String,
    pub url: String,
    pub error_message: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FailedJob {
    /// Retry budget exhausted; never selected again, only removed by cleanup.
    pub fn is_dead(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn is_due_at(&self, now_ms: i64) -> bool {
        !self.is_dead() && self.next_retry_at <= now_ms
    }

    pub fn next_retry_at(&self) -> DateTime<Utc> {
        ms_to_datetime(self.next_retry_at)
    }
}

/// Insert payload for a first failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFailedJob {
    pub job_type: String,
    pub source: String,
    pub external_id: String,
    pub url: String,
    pub error_message: String,
    pub max_retries: i32,
}

impl NewFailedJob {
    pub fn new(
        job_type: impl Into<String>,
        source: impl Into<String>,
        external_id: impl Into<String>,
        url: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            source: source.into(),
            external_id: external_id.into(),
            url: url.into(),
            error_message: error.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(retry_count: i32, next_retry_at: i64) -> FailedJob {
        FailedJob {
            id: 1,
            job_type: "team".into(),
            source: "site".into(),
            external_id: "42".into(),
            url: String::new(),
            error_message: String::new(),
            retry_count,
            max_retries: 3,
            next_retry_at,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_due_and_dead() {
        assert!(job(0, 100).is_due_at(100));
        assert!(!job(0, 101).is_due_at(100));
        assert!(job(3, 0).is_dead());
        assert!(!job(3, 0).is_due_at(100));
    }
}
