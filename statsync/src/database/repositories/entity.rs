//! Crawl entities, per-task progress and parsed records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{CrawlRecord, DiscoveredEntity, StaleEntityRow};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::priority::{STALE_SELECTION_SQL, StaleEntity, StaleQuery};

/// Persistence used by the crawl pipeline.
///
/// Every write is an idempotent upsert so concurrent workers, and the retry
/// worker racing the scheduler, need no further coordination.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Insert or refresh an entity. `discovered_at` survives updates and a
    /// missing name never erases a known one.
    async fn upsert_entity(&self, entity: &DiscoveredEntity) -> Result<()>;

    /// Insert or replace records, keyed by `(record_type, source, external_id)`.
    async fn upsert_records(&self, records: &[CrawlRecord]) -> Result<u64>;

    /// Stale entities in priority order, see [`crate::priority`].
    async fn select_stale_by_priority(
        &self,
        query: &StaleQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleEntity>>;

    /// Record a successful pass of `task_kind` over `entity_id` at `at`.
    /// Unknown entities are ignored.
    async fn mark_processed(
        &self,
        entity_id: &str,
        task_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// SQLx implementation of [`EntityRepository`].
pub struct SqlxEntityRepository {
    pool: SqlitePool,
}

impl SqlxEntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityRepository for SqlxEntityRepository {
    async fn upsert_entity(&self, entity: &DiscoveredEntity) -> Result<()> {
        let id = entity.id();
        let end_marker = entity.end_marker.map(datetime_to_ms);

        retry_on_sqlite_busy("crawl_entity.upsert", || async {
            let now = now_ms();
            sqlx::query(
                r#"
                INSERT INTO crawl_entity (
                    id, source, entity_kind, external_id, url, name,
                    ended, end_marker, discovered_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    url = excluded.url,
                    name = COALESCE(excluded.name, crawl_entity.name),
                    ended = excluded.ended,
                    end_marker = excluded.end_marker,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&entity.source)
            .bind(&entity.entity_kind)
            .bind(&entity.external_id)
            .bind(&entity.url)
            .bind(&entity.name)
            .bind(entity.ended)
            .bind(end_marker)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn upsert_records(&self, records: &[CrawlRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        retry_on_sqlite_busy("crawl_record.upsert", || async {
            let now = now_ms();
            let mut tx = self.pool.begin().await?;
            let mut written = 0u64;

            for record in records {
                let payload = serde_json::to_string(&record.payload)?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO crawl_record (record_type, source, external_id, parent_id, payload, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(record_type, source, external_id) DO UPDATE SET
                        parent_id = excluded.parent_id,
                        payload = excluded.payload,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&record.record_type)
                .bind(&record.source)
                .bind(&record.external_id)
                .bind(&record.parent_id)
                .bind(payload)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                written += result.rows_affected();
            }

            tx.commit().await?;
            Ok(written)
        })
        .await
    }

    async fn select_stale_by_priority(
        &self,
        query: &StaleQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleEntity>> {
        let params = query.params(now);
        let [active, recent, medium, old, archive] = params.rescan_cutoffs_ms;

        let rows = sqlx::query_as::<_, StaleEntityRow>(STALE_SELECTION_SQL)
            .bind(params.recent_cutoff_ms)
            .bind(params.medium_cutoff_ms)
            .bind(params.old_cutoff_ms)
            .bind(&params.task_kind)
            .bind(&params.source)
            .bind(&params.entity_kind)
            .bind(active)
            .bind(recent)
            .bind(medium)
            .bind(old)
            .bind(archive)
            .bind(params.limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(StaleEntity::from).collect())
    }

    async fn mark_processed(
        &self,
        entity_id: &str,
        task_kind: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let at = datetime_to_ms(at);
        retry_on_sqlite_busy("entity_progress.mark", || async {
            sqlx::query(
                r#"
                INSERT INTO entity_progress (entity_id, task_kind, last_processed_at)
                SELECT id, ?, ? FROM crawl_entity WHERE id = ?
                ON CONFLICT(entity_id, task_kind) DO UPDATE SET
                    last_processed_at = excluded.last_processed_at
                "#,
            )
            .bind(task_kind)
            .bind(at)
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::migrated_pool;
    use chrono::{TimeDelta, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 15, 12, 0, 0).unwrap()
    }

    fn tournament(id: &str) -> DiscoveredEntity {
        DiscoveredEntity::new("site", "tournament", id, format!("https://site.test/t/{id}"))
    }

    #[tokio::test]
    async fn test_upsert_entity_is_idempotent() {
        let (pool, _dir) = migrated_pool().await;
        let repo = SqlxEntityRepository::new(pool.clone());

        let entity = tournament("1").with_name("Spring Cup");
        repo.upsert_entity(&entity).await.unwrap();
        let (discovered_at,): (i64,) =
            sqlx::query_as("SELECT discovered_at FROM crawl_entity WHERE id = ?")
                .bind(entity.id())
                .fetch_one(&pool)
                .await
                .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let unnamed = tournament("1").ended_at(now());
        repo.upsert_entity(&unnamed).await.unwrap();
        repo.upsert_entity(&unnamed).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM crawl_entity")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let (name, ended, again): (Option<String>, bool, i64) = sqlx::query_as(
            "SELECT name, ended, discovered_at FROM crawl_entity WHERE id = ?",
        )
        .bind(entity.id())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(name.as_deref(), Some("Spring Cup"));
        assert!(ended);
        assert_eq!(again, discovered_at);
    }

    #[tokio::test]
    async fn test_upsert_records_replaces_payload() {
        let (pool, _dir) = migrated_pool().await;
        let repo = SqlxEntityRepository::new(pool.clone());

        let first = CrawlRecord::new("player", "site", "p1", serde_json::json!({"goals": 1}))
            .with_parent("site:team:7");
        let second = CrawlRecord::new("player", "site", "p1", serde_json::json!({"goals": 2}));
        assert_eq!(repo.upsert_records(&[first]).await.unwrap(), 1);
        repo.upsert_records(&[second]).await.unwrap();
        assert_eq!(repo.upsert_records(&[]).await.unwrap(), 0);

        let (payload,): (String,) = sqlx::query_as(
            "SELECT payload FROM crawl_record WHERE record_type = 'player' AND external_id = 'p1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let payload: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(payload["goals"], 2);
    }

    #[tokio::test]
    async fn test_select_stale_matches_in_memory_selection() {
        let (pool, _dir) = migrated_pool().await;
        let repo = SqlxEntityRepository::new(pool);
        let n = now();

        let fixtures = [
            (tournament("active-never"), None),
            (tournament("active-stale"), Some(n - TimeDelta::hours(6))),
            (tournament("active-fresh"), Some(n - TimeDelta::hours(1))),
            (
                tournament("recent").ended_at(n - TimeDelta::days(10)),
                Some(n - TimeDelta::days(2)),
            ),
            (
                tournament("medium-fresh").ended_at(n - TimeDelta::days(90)),
                Some(n - TimeDelta::days(3)),
            ),
            (tournament("archive").ended_at(n - TimeDelta::days(900)), None),
        ];
        for (entity, last) in &fixtures {
            repo.upsert_entity(entity).await.unwrap();
            if let Some(at) = last {
                repo.mark_processed(&entity.id(), "stats", *at).await.unwrap();
            }
        }
        // Progress for another task kind is ignored.
        repo.mark_processed(&tournament("archive").id(), "players", n)
            .await
            .unwrap();

        let query = StaleQuery::new("site", "tournament", "stats");
        let selected = repo.select_stale_by_priority(&query, n).await.unwrap();
        let ids: Vec<&str> = selected.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["active-never", "active-stale", "recent", "archive"]);

        let expected = query.select(selected.clone(), n);
        assert_eq!(expected, selected);

        let capped = repo
            .select_stale_by_priority(&query.clone().with_limit(Some(2)), n)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[1].external_id, "active-stale");
    }

    #[tokio::test]
    async fn test_mark_processed_moves_entity_out_of_batch() {
        let (pool, _dir) = migrated_pool().await;
        let repo = SqlxEntityRepository::new(pool);
        let n = now();
        let entity = tournament("1");
        repo.upsert_entity(&entity).await.unwrap();

        let query = StaleQuery::new("site", "tournament", "stats");
        assert_eq!(repo.select_stale_by_priority(&query, n).await.unwrap().len(), 1);

        repo.mark_processed(&entity.id(), "stats", n).await.unwrap();
        assert!(repo.select_stale_by_priority(&query, n).await.unwrap().is_empty());
        let later = n + TimeDelta::hours(5);
        assert_eq!(
            repo.select_stale_by_priority(&query, later).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_mark_processed_ignores_unknown_entity() {
        let (pool, _dir) = migrated_pool().await;
        let repo = SqlxEntityRepository::new(pool.clone());
        repo.mark_processed("site:tournament:missing", "stats", now())
            .await
            .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entity_progress")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
