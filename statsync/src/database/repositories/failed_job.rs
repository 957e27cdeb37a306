//! Failed-job store.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{FailedJob, NewFailedJob};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::duration_to_ms;
use crate::retry::backoff;

/// Persisted dead-letter / retry queue.
///
/// Callers pass `now_ms` explicitly so due-selection is deterministic.
#[async_trait]
pub trait FailedJobStore: Send + Sync {
    /// Record a first failure. A row already present for the same
    /// `(job_type, source, external_id)` is left untouched. Returns whether
    /// a row was inserted.
    async fn enqueue(&self, job: &NewFailedJob, now_ms: i64) -> Result<bool>;

    /// Up to `limit` rows with `next_retry_at <= now_ms` and budget left,
    /// earliest due first.
    async fn list_due(&self, now_ms: i64, limit: i64) -> Result<Vec<FailedJob>>;

    /// Retry succeeded: drop the row.
    async fn mark_succeeded(&self, id: i64) -> Result<()>;

    /// Retry failed: bump `retry_count`, push `next_retry_at` out by the
    /// backoff for the new count and keep the latest error text.
    ///
    /// Returns `false` if the row changed underneath (deleted or already
    /// bumped by a concurrent sweep).
    async fn mark_failed(&self, job: &FailedJob, error: &str, now_ms: i64) -> Result<bool>;

    /// Remove every row created before `cutoff_ms`, dead or not.
    async fn cleanup(&self, cutoff_ms: i64) -> Result<u64>;

    /// Rows whose retry budget is exhausted.
    async fn count_dead(&self) -> Result<i64>;

    async fn find(
        &self,
        job_type: &str,
        source: &str,
        external_id: &str,
    ) -> Result<Option<FailedJob>>;
}

/// SQLx implementation of [`FailedJobStore`].
pub struct SqlxFailedJobStore {
    pool: SqlitePool,
}

impl SqlxFailedJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailedJobStore for SqlxFailedJobStore {
    async fn enqueue(&self, job: &NewFailedJob, now_ms: i64) -> Result<bool> {
        let next_retry_at = now_ms.saturating_add(duration_to_ms(backoff(0)));

        retry_on_sqlite_busy("failed_job.enqueue", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO failed_job (
                    job_type, source, external_id, url, error_message,
                    retry_count, max_retries, next_retry_at, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
                ON CONFLICT(job_type, source, external_id) DO NOTHING
                "#,
            )
            .bind(&job.job_type)
            .bind(&job.source)
            .bind(&job.external_id)
            .bind(&job.url)
            .bind(&job.error_message)
            .bind(job.max_retries)
            .bind(next_retry_at)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn list_due(&self, now_ms: i64, limit: i64) -> Result<Vec<FailedJob>> {
        let jobs = sqlx::query_as::<_, FailedJob>(
            r#"
            SELECT * FROM failed_job
            WHERE next_retry_at <= ? AND retry_count < max_retries
            ORDER BY next_retry_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn mark_succeeded(&self, id: i64) -> Result<()> {
        retry_on_sqlite_busy("failed_job.mark_succeeded", || async {
            sqlx::query("DELETE FROM failed_job WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, job: &FailedJob, error: &str, now_ms: i64) -> Result<bool> {
        let retry_count = job.retry_count.saturating_add(1);
        let next_retry_at = now_ms.saturating_add(duration_to_ms(backoff(retry_count)));

        retry_on_sqlite_busy("failed_job.mark_failed", || async {
            let result = sqlx::query(
                r#"
                UPDATE failed_job
                SET retry_count = ?, next_retry_at = ?, error_message = ?, updated_at = ?
                WHERE id = ? AND retry_count = ?
                "#,
            )
            .bind(retry_count)
            .bind(next_retry_at)
            .bind(error)
            .bind(now_ms)
            .bind(job.id)
            .bind(job.retry_count)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn cleanup(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM failed_job WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_dead(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM failed_job WHERE retry_count >= max_retries")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn find(
        &self,
        job_type: &str,
        source: &str,
        external_id: &str,
    ) -> Result<Option<FailedJob>> {
        let job = sqlx::query_as::<_, FailedJob>(
            "SELECT * FROM failed_job WHERE job_type = ? AND source = ? AND external_id = ?",
        )
        .bind(job_type)
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }
}
