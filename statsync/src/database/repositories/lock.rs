//! SQLite-backed [`Locker`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use crate::Result;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{duration_to_ms, now_ms};
use crate::lock::Locker;

/// Lock rows in `job_lock`, shared by every instance using the same store.
pub struct SqlxLocker {
    pool: SqlitePool,
}

impl SqlxLocker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Locker for SqlxLocker {
    async fn try_acquire(&self, job_name: &str, ttl: Duration, owner_id: &str) -> Result<bool> {
        let acquired = retry_on_sqlite_busy("job_lock.try_acquire", || async {
            let now = now_ms();
            let until = now.saturating_add(duration_to_ms(ttl));

            // The WHERE on the conflict branch turns a still-valid lock into a
            // zero-row update instead of a takeover.
            let result = sqlx::query(
                r#"
                INSERT INTO job_lock (job_name, locked_at, locked_until, owner_id)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(job_name) DO UPDATE SET
                    locked_at = excluded.locked_at,
                    locked_until = excluded.locked_until,
                    owner_id = excluded.owner_id
                WHERE job_lock.locked_until < ?
                "#,
            )
            .bind(job_name)
            .bind(now)
            .bind(until)
            .bind(owner_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() == 1)
        })
        .await?;

        debug!(job = job_name, owner = owner_id, acquired, "lock acquisition attempted");
        Ok(acquired)
    }

    async fn release(&self, job_name: &str, owner_id: &str) -> Result<()> {
        retry_on_sqlite_busy("job_lock.release", || async {
            sqlx::query("DELETE FROM job_lock WHERE job_name = ? AND owner_id = ?")
                .bind(job_name)
                .bind(owner_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn release_all(&self, owner_id: &str) -> Result<u64> {
        retry_on_sqlite_busy("job_lock.release_all", || async {
            let result = sqlx::query("DELETE FROM job_lock WHERE owner_id = ?")
                .bind(owner_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::JobLockDbModel;
    use crate::database::test_support::migrated_pool;

    const TTL: Duration = Duration::from_secs(60);

    async fn lock_row(pool: &SqlitePool, job: &str) -> Option<JobLockDbModel> {
        sqlx::query_as::<_, JobLockDbModel>("SELECT * FROM job_lock WHERE job_name = ?")
            .bind(job)
            .fetch_optional(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_writes_row() {
        let (pool, _dir) = migrated_pool().await;
        let locker = SqlxLocker::new(pool.clone());

        assert!(locker.try_acquire("crawl", TTL, "a").await.unwrap());
        let row = lock_row(&pool, "crawl").await.unwrap();
        assert_eq!(row.owner_id, "a");
        assert_eq!(row.locked_until - row.locked_at, 60_000);
    }

    #[tokio::test]
    async fn test_valid_lock_is_not_reentrant() {
        let (pool, _dir) = migrated_pool().await;
        let locker = SqlxLocker::new(pool);

        assert!(locker.try_acquire("crawl", TTL, "a").await.unwrap());
        assert!(!locker.try_acquire("crawl", TTL, "a").await.unwrap());
        assert!(!locker.try_acquire("crawl", TTL, "b").await.unwrap());
        assert!(locker.try_acquire("other", TTL, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (pool, _dir) = migrated_pool().await;
        let locker = SqlxLocker::new(pool.clone());

        assert!(
            locker
                .try_acquire("crawl", Duration::from_millis(10), "a")
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(locker.try_acquire("crawl", TTL, "b").await.unwrap());
        assert_eq!(lock_row(&pool, "crawl").await.unwrap().owner_id, "b");
    }

    #[tokio::test]
    async fn test_late_release_does_not_steal() {
        let (pool, _dir) = migrated_pool().await;
        let locker = SqlxLocker::new(pool.clone());

        locker
            .try_acquire("crawl", Duration::from_millis(10), "a")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        locker.try_acquire("crawl", TTL, "b").await.unwrap();

        locker.release("crawl", "a").await.unwrap();
        assert_eq!(lock_row(&pool, "crawl").await.unwrap().owner_id, "b");

        locker.release("crawl", "b").await.unwrap();
        assert!(lock_row(&pool, "crawl").await.is_none());
    }

    #[tokio::test]
    async fn test_release_all() {
        let (pool, _dir) = migrated_pool().await;
        let locker = SqlxLocker::new(pool);

        locker.try_acquire("one", TTL, "a").await.unwrap();
        locker.try_acquire("two", TTL, "a").await.unwrap();
        locker.try_acquire("three", TTL, "b").await.unwrap();

        assert_eq!(locker.release_all("a").await.unwrap(), 2);
        assert_eq!(locker.release_all("a").await.unwrap(), 0);
        assert!(locker.try_acquire("one", TTL, "b").await.unwrap());
        assert!(!locker.try_acquire("three", TTL, "a").await.unwrap());
    }
}
