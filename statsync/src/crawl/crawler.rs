//! Two-phase crawl over one source: discovery, then stale refresh.
//!
//! Discovery fans out over the source's domains, refresh fans out over stale
//! entities and, from inside each entity task, over that entity's teams. All
//! three levels run on [`task_pool::TaskExecutor`] and share one [`DedupSet`]
//! per run.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use task_pool::{BoxError, ExecutorConfig, FnHandler, TaskError, TaskExecutor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser::{CrawlTarget, FetchRetry, ParsedItem, Segment, SiteParser, TeamRef};
use crate::Result;
use crate::config::CrawlSettings;
use crate::database::models::{
    CrawlRecord, DiscoveredEntity, FailedJob, NewFailedJob, entity_id,
};
use crate::database::repositories::{EntityRepository, FailedJobStore};
use crate::database::time::now_ms;
use crate::dedup::DedupSet;
use crate::metrics::MetricsCollector;
use crate::priority::{StaleEntity, StaleQuery};

/// Failed-job type for team pages.
pub const TEAM_JOB_TYPE: &str = "team";

const TEAM_KIND: &str = "team";

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Kind of entity this crawler discovers and refreshes.
    pub entity_kind: String,
    /// Progress column consulted for staleness.
    pub task_kind: String,
    pub settings: CrawlSettings,
}

impl CrawlerConfig {
    pub fn new(entity_kind: impl Into<String>, task_kind: impl Into<String>) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            task_kind: task_kind.into(),
            settings: CrawlSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CrawlSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Counters for one [`StatsCrawler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub domains: usize,
    pub domains_skipped: usize,
    pub domains_failed: usize,
    pub discovered: usize,
    pub selected: usize,
    pub processed: usize,
    pub failed: usize,
    pub records: u64,
    pub teams: usize,
    pub team_failures: usize,
    pub enqueued: usize,
}

#[derive(Debug, Default)]
struct DomainOutcome {
    skipped: bool,
    discovered: usize,
}

#[derive(Debug, Default)]
struct EntityOutcome {
    records: u64,
    teams: usize,
    team_failures: usize,
}

pub struct StatsCrawler {
    parser: Arc<dyn SiteParser>,
    entities: Arc<dyn EntityRepository>,
    failed_jobs: Arc<dyn FailedJobStore>,
    metrics: Arc<MetricsCollector>,
    config: CrawlerConfig,
}

impl StatsCrawler {
    pub fn new(
        parser: Arc<dyn SiteParser>,
        entities: Arc<dyn EntityRepository>,
        failed_jobs: Arc<dyn FailedJobStore>,
        metrics: Arc<MetricsCollector>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            parser,
            entities,
            failed_jobs,
            metrics,
            config,
        }
    }

    pub fn source(&self) -> &str {
        self.parser.source()
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    fn fetch_retry(&self) -> FetchRetry {
        FetchRetry {
            attempts: self.config.settings.fetch_attempts,
            delay: self.config.settings.fetch_retry_delay,
        }
    }

    /// Discover new entities, then refresh at most `batch_cap` stale ones.
    pub async fn run(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        batch_cap: Option<usize>,
    ) -> Result<CrawlReport> {
        let dedup = Arc::new(DedupSet::new());
        let mut report = CrawlReport::default();

        self.discover(cancel, &dedup, &mut report).await;
        if cancel.is_cancelled() {
            info!(source = %self.source(), "Crawl cancelled after discovery");
            return Ok(report);
        }

        self.refresh(cancel, &dedup, batch_cap, &mut report).await?;

        info!(
            source = %self.source(),
            domains = report.domains,
            domains_skipped = report.domains_skipped,
            discovered = report.discovered,
            selected = report.selected,
            processed = report.processed,
            failed = report.failed,
            records = report.records,
            teams = report.teams,
            enqueued = report.enqueued,
            "Crawl finished"
        );
        Ok(report)
    }

    async fn discover(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        dedup: &Arc<DedupSet>,
        report: &mut CrawlReport,
    ) {
        let domains = self.parser.domains();
        report.domains = domains.len();
        if domains.is_empty() {
            return;
        }

        let crawler = self.clone();
        let dedup = dedup.clone();
        let token = cancel.clone();
        let handler = FnHandler::<String, _, _>::new(
            |domain: &String| domain.clone(),
            move |domain: String| {
                let crawler = crawler.clone();
                let dedup = dedup.clone();
                let token = token.clone();
                async move {
                    crawler
                        .crawl_domain(&domain, &dedup, &token)
                        .await
                        .map_err(BoxError::from)
                }
            },
        );

        let executor: TaskExecutor<String, DomainOutcome> = TaskExecutor::new(
            cancel.child_token(),
            ExecutorConfig::new(
                "domains",
                self.config.settings.domain_workers,
                self.config.settings.task_timeout,
            ),
            Arc::new(handler),
        );

        for result in executor.run_batch(domains).await {
            match result.outcome {
                Ok(outcome) if outcome.skipped => report.domains_skipped += 1,
                Ok(outcome) => report.discovered += outcome.discovered,
                Err(TaskError::Cancelled) => {}
                Err(e) => {
                    report.domains_failed += 1;
                    warn!(domain = %result.key, error = %e, "Domain discovery failed");
                }
            }
        }
    }

    /// Sample the latest segment, then list the full domain unless every
    /// sampled entity was already seen this run.
    async fn crawl_domain(
        &self,
        domain: &str,
        dedup: &DedupSet,
        cancel: &CancellationToken,
    ) -> Result<DomainOutcome> {
        let retry = self.fetch_retry();
        let latest = CrawlTarget::Domain {
            domain: domain.to_string(),
            segment: Segment::Latest,
        };
        let sampled = entity_ids(&retry.parse(self.parser.as_ref(), &latest, cancel).await?);
        let sample = dedup.sample(sampled.iter().map(String::as_str));

        if sample.is_mirror() {
            self.metrics.record_domain_skipped();
            info!(
                source = %self.source(),
                domain,
                sampled = sample.sampled,
                "Skipping mirror domain"
            );
            return Ok(DomainOutcome {
                skipped: true,
                ..Default::default()
            });
        }
        debug!(
            domain,
            sampled = sample.sampled,
            seen = sample.seen,
            "Domain sample not fully seen, listing"
        );

        let full = CrawlTarget::Domain {
            domain: domain.to_string(),
            segment: Segment::Full,
        };
        let mut outcome = DomainOutcome::default();
        for item in retry.parse(self.parser.as_ref(), &full, cancel).await? {
            let ParsedItem::Entity(entity) = item else {
                continue;
            };
            if entity.entity_kind != self.config.entity_kind
                || dedup.check_and_mark(&entity.id())
            {
                continue;
            }
            self.entities.upsert_entity(&entity).await?;
            outcome.discovered += 1;
        }
        Ok(outcome)
    }

    async fn refresh(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        dedup: &Arc<DedupSet>,
        batch_cap: Option<usize>,
        report: &mut CrawlReport,
    ) -> Result<()> {
        let query = StaleQuery::new(
            self.source(),
            &self.config.entity_kind,
            &self.config.task_kind,
        )
        .with_limit(batch_cap);
        let stale = self.entities.select_stale_by_priority(&query, Utc::now()).await?;
        report.selected = stale.len();
        if stale.is_empty() {
            debug!(source = %self.source(), "No stale entities");
            return Ok(());
        }

        let crawler = self.clone();
        let dedup = dedup.clone();
        let token = cancel.clone();
        let handler = FnHandler::<StaleEntity, _, _>::new(
            |entity: &StaleEntity| entity.id.clone(),
            move |entity: StaleEntity| {
                let crawler = crawler.clone();
                let dedup = dedup.clone();
                let token = token.clone();
                async move {
                    crawler
                        .crawl_entity(entity, &dedup, &token)
                        .await
                        .map_err(BoxError::from)
                }
            },
        );

        let executor: TaskExecutor<StaleEntity, EntityOutcome> = TaskExecutor::new(
            cancel.child_token(),
            ExecutorConfig::new(
                "entities",
                self.config.settings.tournament_workers,
                self.config.settings.task_timeout,
            ),
            Arc::new(handler),
        );
        let results = executor.run_batch(stale.clone()).await;

        for result in results {
            match result.outcome {
                Ok(outcome) => {
                    report.processed += 1;
                    report.records += outcome.records;
                    report.teams += outcome.teams;
                    report.team_failures += outcome.team_failures;
                    report.enqueued += outcome.team_failures;
                }
                Err(TaskError::Cancelled) => {}
                Err(e) => {
                    report.failed += 1;
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let Some(entity) = stale.get(result.index) else {
                        continue;
                    };
                    warn!(entity = %entity.id, error = %e, "Entity refresh failed");
                    if self
                        .enqueue_failure(&self.config.entity_kind, &entity.external_id, &entity.url, &e)
                        .await
                    {
                        report.enqueued += 1;
                    }
                }
            }
        }

        self.metrics
            .record_stale_processed(self.source(), report.processed as u64);
        Ok(())
    }

    /// Parse one entity, persist its records, crawl its teams and mark it
    /// processed.
    async fn crawl_entity(
        self: Arc<Self>,
        entity: StaleEntity,
        dedup: &Arc<DedupSet>,
        cancel: &CancellationToken,
    ) -> Result<EntityOutcome> {
        let items = self
            .fetch_retry()
            .parse(self.parser.as_ref(), &CrawlTarget::Entity(entity.clone()), cancel)
            .await?;

        let (records, teams) = split_items(items, &entity.id);
        let mut outcome = EntityOutcome {
            records: self.persist_records(&records).await?,
            ..Default::default()
        };

        let teams: Vec<TeamRef> = teams
            .into_iter()
            .filter(|team| {
                !dedup.check_and_mark(&entity_id(self.source(), TEAM_KIND, &team.external_id))
            })
            .collect();
        outcome.teams = teams.len();

        if !teams.is_empty() {
            let (team_records, failures) = self.crawl_teams(&entity.id, teams, cancel).await;
            outcome.records += team_records;
            outcome.team_failures = failures;
        }

        self.entities
            .mark_processed(&entity.id, &self.config.task_kind, Utc::now())
            .await?;
        Ok(outcome)
    }

    async fn crawl_teams(
        self: &Arc<Self>,
        parent_id: &str,
        teams: Vec<TeamRef>,
        cancel: &CancellationToken,
    ) -> (u64, usize) {
        let crawler = self.clone();
        let parent = parent_id.to_string();
        let token = cancel.clone();
        let handler = FnHandler::<TeamRef, _, _>::new(
            |team: &TeamRef| team.external_id.clone(),
            move |team: TeamRef| {
                let crawler = crawler.clone();
                let parent = parent.clone();
                let token = token.clone();
                async move {
                    crawler
                        .crawl_team(team, Some(parent), &token)
                        .await
                        .map_err(BoxError::from)
                }
            },
        );

        let executor: TaskExecutor<TeamRef, u64> = TaskExecutor::new(
            cancel.child_token(),
            ExecutorConfig::new(
                "teams",
                self.config.settings.team_workers,
                self.config.settings.task_timeout,
            ),
            Arc::new(handler),
        );
        let results = executor.run_batch(teams.clone()).await;

        let mut records = 0;
        let mut failures = 0;
        for result in results {
            match result.outcome {
                Ok(count) => records += count,
                Err(TaskError::Cancelled) => {}
                Err(e) => {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let Some(team) = teams.get(result.index) else {
                        continue;
                    };
                    warn!(parent = parent_id, team = %team.external_id, error = %e, "Team crawl failed");
                    if self
                        .enqueue_failure(TEAM_JOB_TYPE, &team.external_id, &team.url, &e)
                        .await
                    {
                        failures += 1;
                    }
                }
            }
        }
        (records, failures)
    }

    async fn crawl_team(
        &self,
        team: TeamRef,
        parent_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let target = CrawlTarget::Team { team, parent_id };
        let items = self
            .fetch_retry()
            .parse(self.parser.as_ref(), &target, cancel)
            .await?;

        let records: Vec<CrawlRecord> = items
            .into_iter()
            .filter_map(|item| match item {
                ParsedItem::Record(record) => Some(record),
                _ => None,
            })
            .collect();
        self.persist_records(&records).await
    }

    async fn persist_records(&self, records: &[CrawlRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let written = self.entities.upsert_records(records).await?;

        let mut per_type: BTreeMap<&str, u64> = BTreeMap::new();
        for record in records {
            *per_type.entry(record.record_type.as_str()).or_default() += 1;
        }
        for (record_type, count) in per_type {
            self.metrics.record_records_persisted(record_type, count);
        }
        Ok(written)
    }

    /// Returns whether a new failed-job row was created. Storage errors are
    /// logged and swallowed so one bad write cannot fail the whole batch.
    async fn enqueue_failure(
        &self,
        job_type: &str,
        external_id: &str,
        url: &str,
        error: &TaskError,
    ) -> bool {
        let job = NewFailedJob::new(job_type, self.source(), external_id, url, error);
        match self.failed_jobs.enqueue(&job, now_ms()).await {
            Ok(created) => {
                if created {
                    self.metrics.record_failed_job_enqueued(job_type);
                }
                created
            }
            Err(e) => {
                warn!(job_type, external_id, error = %e, "Could not record failed job");
                false
            }
        }
    }

    /// Replay a failed entity refresh.
    pub async fn retry_entity(self: &Arc<Self>, job: &FailedJob, cancel: &CancellationToken) -> Result<()> {
        let entity = StaleEntity {
            id: entity_id(&job.source, &self.config.entity_kind, &job.external_id),
            source: job.source.clone(),
            entity_kind: self.config.entity_kind.clone(),
            external_id: job.external_id.clone(),
            url: job.url.clone(),
            name: None,
            ended: false,
            end_marker: None,
            last_processed_at: None,
        };
        let outcome = self
            .clone()
            .crawl_entity(entity, &Arc::new(DedupSet::new()), cancel)
            .await?;
        debug!(
            external_id = %job.external_id,
            records = outcome.records,
            teams = outcome.teams,
            "Entity retry persisted"
        );
        Ok(())
    }

    /// Replay a failed team crawl.
    pub async fn retry_team(&self, job: &FailedJob, cancel: &CancellationToken) -> Result<()> {
        let team = TeamRef {
            external_id: job.external_id.clone(),
            url: job.url.clone(),
            name: None,
        };
        self.crawl_team(team, None, cancel).await?;
        Ok(())
    }
}

fn entity_ids(items: &[ParsedItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            ParsedItem::Entity(entity) => Some(entity.id()),
            _ => None,
        })
        .collect()
}

/// Records (parented to `parent_id` when the parser left it blank) and teams.
fn split_items(items: Vec<ParsedItem>, parent_id: &str) -> (Vec<CrawlRecord>, Vec<TeamRef>) {
    let mut records = Vec::new();
    let mut teams = Vec::new();
    for item in items {
        match item {
            ParsedItem::Record(record) if record.parent_id.is_none() => {
                records.push(record.with_parent(parent_id))
            }
            ParsedItem::Record(record) => records.push(record),
            ParsedItem::Team(team) => teams.push(team),
            ParsedItem::Entity(DiscoveredEntity { .. }) => {}
        }
    }
    (records, teams)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::crawl::FetchError;

    /// Scripted site: fixed listings per domain, records and teams per
    /// entity, and a set of ids that always fail.
    #[derive(Default)]
    pub struct FakeSite {
        pub source: Option<String>,
        pub domains: Vec<String>,
        pub latest: HashMap<String, Vec<DiscoveredEntity>>,
        pub full: HashMap<String, Vec<DiscoveredEntity>>,
        pub teams: HashMap<String, Vec<TeamRef>>,
        pub failing: HashSet<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeSite {
        pub fn with_source(mut self, source: &str) -> Self {
            self.source = Some(source.to_string());
            self
        }

        pub fn with_domain(mut self, domain: &str, entities: Vec<DiscoveredEntity>) -> Self {
            self.domains.push(domain.to_string());
            self.latest
                .insert(domain.to_string(), entities.iter().take(2).cloned().collect());
            self.full.insert(domain.to_string(), entities);
            self
        }

        pub fn with_teams(mut self, entity_external_id: &str, teams: &[&str]) -> Self {
            self.teams.insert(
                entity_external_id.to_string(),
                teams
                    .iter()
                    .map(|id| TeamRef {
                        external_id: id.to_string(),
                        url: format!("https://site.test/team/{id}"),
                        name: None,
                    })
                    .collect(),
            );
            self
        }

        pub fn failing(mut self, external_id: &str) -> Self {
            self.failing.insert(external_id.to_string());
            self
        }

        pub fn calls_matching(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl SiteParser for FakeSite {
        fn source(&self) -> &str {
            self.source.as_deref().unwrap_or("site")
        }

        fn domains(&self) -> Vec<String> {
            self.domains.clone()
        }

        async fn parse(&self, target: &CrawlTarget) -> std::result::Result<Vec<ParsedItem>, FetchError> {
            match target {
                CrawlTarget::Domain { domain, segment } => {
                    self.calls.lock().push(format!("domain:{domain}:{segment:?}"));
                    let listing = match segment {
                        Segment::Latest => &self.latest,
                        Segment::Full => &self.full,
                    };
                    Ok(listing
                        .get(domain)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(ParsedItem::Entity)
                        .collect())
                }
                CrawlTarget::Entity(entity) => {
                    self.calls.lock().push(format!("entity:{}", entity.external_id));
                    if self.failing.contains(&entity.external_id) {
                        return Err(FetchError::Parse("broken table".into()));
                    }
                    let mut items = vec![ParsedItem::Record(CrawlRecord::new(
                        "player",
                        "site",
                        format!("p-{}", entity.external_id),
                        serde_json::json!({"goals": 3}),
                    ))];
                    for team in self.teams.get(&entity.external_id).into_iter().flatten() {
                        items.push(ParsedItem::Team(team.clone()));
                    }
                    Ok(items)
                }
                CrawlTarget::Team { team, .. } => {
                    self.calls.lock().push(format!("team:{}", team.external_id));
                    if self.failing.contains(&team.external_id) {
                        return Err(FetchError::Transient("503".into()));
                    }
                    Ok(vec![ParsedItem::Record(CrawlRecord::new(
                        "team_stats",
                        "site",
                        team.external_id.clone(),
                        serde_json::json!({"wins": 7}),
                    ))])
                }
            }
        }
    }

    pub fn tournament(id: &str) -> DiscoveredEntity {
        DiscoveredEntity::new("site", "tournament", id, format!("https://site.test/t/{id}"))
    }

    pub fn fast_settings() -> CrawlSettings {
        CrawlSettings {
            fetch_retry_delay: std::time::Duration::from_millis(1),
            ..Default::default()
        }
    }
}
