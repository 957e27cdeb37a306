//! Crawl, fail, retry: the whole pipeline against one SQLite file.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use statsync::config::{AppConfig, CrawlSettings, JobsConfig};
use statsync::crawl::{
    CrawlRetryHandler, CrawlTarget, FetchError, ParsedItem, Segment, SiteParser, TEAM_JOB_TYPE,
    TeamRef,
};
use statsync::database::models::{CrawlRecord, DiscoveredEntity};
use statsync::database::repositories::{EntityRepository, FailedJobStore};
use statsync::database::time::now_ms;
use statsync::database::{DbPool, init_pool_with_size, run_migrations};
use statsync::priority::StaleQuery;
use statsync::retry::{RetryConfig, RetryWorker};
use statsync::scheduler::JobDefinition;
use statsync::services::ServiceContainer;

async fn setup_db(dir: &TempDir) -> DbPool {
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path().join("crawl.db").to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool_with_size(&url, 8).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// Two mirrored domains, a few tournaments sharing teams, and a team page
/// that is down until `heal` is called.
struct LeagueSite {
    tournaments: Vec<DiscoveredEntity>,
    teams: HashMap<String, Vec<&'static str>>,
    down: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<String>>,
}

impl LeagueSite {
    fn new() -> Self {
        let ended = Utc::now() - TimeDelta::days(400);
        Self {
            tournaments: vec![
                DiscoveredEntity::new("league", "tournament", "cup-2025", "https://league.test/cup-2025")
                    .with_name("Cup 2025"),
                DiscoveredEntity::new("league", "tournament", "cup-2024", "https://league.test/cup-2024")
                    .ended_at(ended),
                DiscoveredEntity::new("league", "tournament", "shield", "https://league.test/shield"),
            ],
            teams: HashMap::from([
                ("cup-2025".to_string(), vec!["lions", "tigers"]),
                ("cup-2024".to_string(), vec!["lions", "bears"]),
                ("shield".to_string(), vec!["tigers"]),
            ]),
            down: Mutex::new(HashSet::from(["bears".to_string()])),
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn heal(&self) {
        self.down.lock().clear();
    }

    fn fetch_count(&self, key: &str) -> usize {
        self.fetched.lock().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl SiteParser for LeagueSite {
    fn source(&self) -> &str {
        "league"
    }

    fn domains(&self) -> Vec<String> {
        vec!["league.test".into(), "mirror.league.test".into()]
    }

    async fn parse(&self, target: &CrawlTarget) -> Result<Vec<ParsedItem>, FetchError> {
        match target {
            CrawlTarget::Domain { segment, .. } => {
                let take = match segment {
                    Segment::Latest => 1,
                    Segment::Full => self.tournaments.len(),
                };
                Ok(self
                    .tournaments
                    .iter()
                    .take(take)
                    .cloned()
                    .map(ParsedItem::Entity)
                    .collect())
            }
            CrawlTarget::Entity(entity) => {
                self.fetched.lock().push(entity.external_id.clone());
                let mut items = vec![ParsedItem::Record(CrawlRecord::new(
                    "standings",
                    "league",
                    entity.external_id.clone(),
                    serde_json::json!({"rows": 8}),
                ))];
                for team in self.teams.get(&entity.external_id).into_iter().flatten() {
                    items.push(ParsedItem::Team(TeamRef {
                        external_id: team.to_string(),
                        url: format!("https://league.test/team/{team}"),
                        name: None,
                    }));
                }
                Ok(items)
            }
            CrawlTarget::Team { team, .. } => {
                self.fetched.lock().push(team.external_id.clone());
                if self.down.lock().contains(&team.external_id) {
                    return Err(FetchError::Transient("502 bad gateway".into()));
                }
                Ok(vec![ParsedItem::Record(CrawlRecord::new(
                    "team_stats",
                    "league",
                    team.external_id.clone(),
                    serde_json::json!({"played": 10}),
                ))])
            }
        }
    }
}

fn app_config() -> AppConfig {
    AppConfig {
        instance_id: "it".into(),
        crawl: CrawlSettings {
            fetch_attempts: 2,
            fetch_retry_delay: std::time::Duration::from_millis(1),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crawl_then_retry_recovers_team() {
    let dir = TempDir::new().unwrap();
    let pool = setup_db(&dir).await;
    let jobs = JobsConfig {
        jobs: vec![JobDefinition::new("crawl-league", "0 */15 * * * *")],
    };
    let mut container = ServiceContainer::with_pool(pool.clone(), app_config(), jobs).unwrap();
    let site = Arc::new(LeagueSite::new());
    let crawler = container.register_crawler("crawl-league", site.clone(), "tournament", "stats");

    let report = crawler.run(&CancellationToken::new(), None).await.unwrap();
    assert_eq!(report.discovered, 3);
    assert_eq!(report.domains_failed, 0);
    // Whether the mirror is skipped depends on which domain lists first.
    assert!(report.domains_skipped <= 1);
    assert_eq!(report.processed, 3);
    assert_eq!(report.teams, 3, "lions and tigers are crawled once per run");
    assert_eq!(site.fetch_count("lions"), 1);
    assert_eq!(report.team_failures, 1);

    let bears = container
        .failed_jobs
        .find(TEAM_JOB_TYPE, "league", "bears")
        .await
        .unwrap()
        .expect("bears failure recorded");
    assert_eq!(bears.retry_count, 0);
    assert_eq!(container.metrics.snapshot().domains_skipped, report.domains_skipped as u64);

    // A tournament with a failed team is still marked processed.
    let stale = container
        .entities
        .select_stale_by_priority(&StaleQuery::new("league", "tournament", "stats"), Utc::now())
        .await
        .unwrap();
    assert!(stale.is_empty());

    // Nothing is due before the first backoff, then the healed page recovers.
    site.heal();
    let mut worker = RetryWorker::new(
        RetryConfig::default(),
        container.failed_jobs.clone(),
        container.metrics.clone(),
    );
    worker.register(
        TEAM_JOB_TYPE,
        Arc::new(CrawlRetryHandler::new(crawler.clone(), CancellationToken::new())),
    );
    assert_eq!(worker.process_at(now_ms()).await.unwrap().due, 0);

    let later = bears.next_retry_at + 1;
    let sweep = worker.process_at(later).await.unwrap();
    assert_eq!(sweep.succeeded, 1);
    assert!(
        container
            .failed_jobs
            .find(TEAM_JOB_TYPE, "league", "bears")
            .await
            .unwrap()
            .is_none()
    );

    let (team_rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM crawl_record WHERE record_type = 'team_stats'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(team_rows, 3);
}

#[tokio::test]
async fn test_stale_selection_prefers_active_then_oldest() {
    let dir = TempDir::new().unwrap();
    let pool = setup_db(&dir).await;
    let container =
        ServiceContainer::with_pool(pool, app_config(), JobsConfig::default()).unwrap();
    let repo = container.entities.clone();
    let now = Utc::now();

    let archived = DiscoveredEntity::new("league", "tournament", "1990", "u")
        .ended_at(now - TimeDelta::days(3650));
    let recent = DiscoveredEntity::new("league", "tournament", "last-month", "u")
        .ended_at(now - TimeDelta::days(20));
    let active = DiscoveredEntity::new("league", "tournament", "live", "u");
    for entity in [&archived, &recent, &active] {
        repo.upsert_entity(entity).await.unwrap();
    }

    let query = StaleQuery::new("league", "tournament", "stats");
    let order: Vec<String> = repo
        .select_stale_by_priority(&query, now)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.external_id)
        .collect();
    assert_eq!(order, vec!["live", "last-month", "1990"]);

    repo.mark_processed(&active.id(), "stats", now).await.unwrap();
    let capped = repo
        .select_stale_by_priority(&query.with_limit(Some(1)), now)
        .await
        .unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].external_id, "last-month");
}
