//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Job {job} timed out after {timeout_secs}s")]
    JobTimeout { job: String, timeout_secs: u64 },

    #[error("Handler for {job} failed: {message}")]
    Handler { job: String, message: String },

    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::crawl::FetchError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn handler(job: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Handler {
            job: job.into(),
            message: message.to_string(),
        }
    }

    /// Stable label for the error-kind metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseSqlx(_) | Self::Migration(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::InvalidCron { .. } | Self::Configuration(_) => "configuration",
            Self::JobTimeout { .. } => "timeout",
            Self::Handler { .. } => "handler",
            Self::Fetch(_) => "fetch",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}
