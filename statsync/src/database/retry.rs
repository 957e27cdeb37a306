//! Busy/locked retry for SQLite writes.
//!
//! Several instances share one database file, so short write collisions are
//! expected. Statements that take or drop job locks, or touch the failed-job
//! queue, run through [`retry_on_sqlite_busy`].

use std::future::Future;
use std::time::Duration;

use rand::random;
use tracing::debug;

use crate::{Error, Result};

/// Capped exponential delay with up to 25% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl BusyRetry {
    pub const DEFAULT: Self = Self {
        max_retries: 12,
        base: Duration::from_millis(10),
        cap: Duration::from_secs(2),
    };

    pub fn delay(&self, attempt: u32) -> Duration {
        let cap_ms = self.cap.as_millis() as u64;
        let backoff_ms = (self.base.as_millis() as u64)
            .saturating_mul(1u64 << attempt.min(16))
            .min(cap_ms);
        let jitter_ms = random::<u64>() % (backoff_ms / 4 + 1);
        Duration::from_millis(backoff_ms.saturating_add(jitter_ms).min(cap_ms))
    }
}

const BUSY_MESSAGES: [&str; 2] = ["database is locked", "database is busy"];

fn mentions_busy(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    BUSY_MESSAGES.iter().any(|m| message.contains(m))
}

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), by code or by message.
pub fn is_sqlite_busy(err: &Error) -> bool {
    match err {
        Error::DatabaseSqlx(sqlx::Error::Database(db)) => {
            matches!(db.code().as_deref(), Some("5" | "6")) || mentions_busy(db.message())
        }
        Error::DatabaseSqlx(other) => mentions_busy(&other.to_string()),
        _ => false,
    }
}

/// Run `op`, re-running it with [`BusyRetry::DEFAULT`] while SQLite reports
/// busy. Any other error, or exhausting the retries, returns the last error.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(BusyRetry::DEFAULT, op_name, op).await
}

pub async fn retry_with<T, F, Fut>(policy: BusyRetry, op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.max_retries || !is_sqlite_busy(&err) {
            return Err(err);
        }

        let delay = policy.delay(attempt);
        attempt += 1;
        debug!(
            op = op_name,
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "SQLite busy, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
