//! Service container for dependency injection.
//!
//! The ServiceContainer builds every component from one pool and one
//! [`AppConfig`], collects job and retry handlers, and hands over to
//! [`RunningServices`] once started.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::config::{AppConfig, JobsConfig};
use crate::crawl::{CrawlJob, CrawlRetryHandler, CrawlerConfig, SiteParser, StatsCrawler};
use crate::database::repositories::{
    FailedJobStore, SqlxEntityRepository, SqlxFailedJobStore, SqlxLocker,
};
use crate::database::time::{duration_to_ms, now_ms};
use crate::database::{init_pool, run_migrations};
use crate::lock::Locker;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::retry::{RetryHandler, RetryWorker};
use crate::scheduler::{JobHandler, RunOnceReport, Scheduler, SchedulerConfig, handler_fn};

/// Built-in job purging old failed-job rows.
pub const FAILED_JOBS_CLEANUP_JOB: &str = "failed-jobs-cleanup";

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: SqlitePool,
    pub config: AppConfig,
    pub locker: Arc<dyn Locker>,
    pub failed_jobs: Arc<SqlxFailedJobStore>,
    pub entities: Arc<SqlxEntityRepository>,
    pub metrics: Arc<MetricsCollector>,
    scheduler: Scheduler,
    retry_worker: RetryWorker,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Open the configured database, migrate it and build the services.
    pub async fn new(config: AppConfig, jobs: JobsConfig) -> Result<Self> {
        let pool = init_pool(&config.database_url).await?;
        run_migrations(&pool).await?;
        Self::with_pool(pool, config, jobs)
    }

    /// Build the services on an already migrated pool.
    pub fn with_pool(pool: SqlitePool, config: AppConfig, jobs: JobsConfig) -> Result<Self> {
        info!(instance = %config.instance_id, "Initializing service container");

        let locker: Arc<dyn Locker> = Arc::new(SqlxLocker::new(pool.clone()));
        let failed_jobs = Arc::new(SqlxFailedJobStore::new(pool.clone()));
        let entities = Arc::new(SqlxEntityRepository::new(pool.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let cancellation_token = CancellationToken::new();

        let scheduler_config = SchedulerConfig {
            owner_id: config.instance_id.clone(),
            lock_grace: config.lock_grace,
            shutdown_timeout: config.shutdown_timeout,
        };
        let mut scheduler = Scheduler::new(
            scheduler_config,
            jobs.jobs,
            locker.clone(),
            metrics.clone(),
            &cancellation_token,
        )?;
        scheduler.register_handler(
            FAILED_JOBS_CLEANUP_JOB,
            cleanup_handler(failed_jobs.clone(), config.failed_job_retention),
        );

        let retry_worker =
            RetryWorker::new(config.retry.clone(), failed_jobs.clone(), metrics.clone());

        info!("Service container initialized");
        Ok(Self {
            pool,
            config,
            locker,
            failed_jobs,
            entities,
            metrics,
            scheduler,
            retry_worker,
            cancellation_token,
        })
    }

    pub fn register_job(&mut self, job_name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.scheduler.register_handler(job_name, handler);
    }

    pub fn register_retry_handler(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn RetryHandler>,
    ) {
        self.retry_worker.register(job_type, handler);
    }

    /// Like [`Self::register_retry_handler`], limited to rows of `source`.
    pub fn register_source_retry_handler(
        &mut self,
        job_type: impl Into<String>,
        source: impl Into<String>,
        handler: Arc<dyn RetryHandler>,
    ) {
        self.retry_worker.register_for_source(job_type, source, handler);
    }

    /// Wire a site parser as job `job_name`, and route its failed jobs to the
    /// retry worker. Each source gets its own retry routes, so several
    /// crawlers can share the failed-job queue.
    pub fn register_crawler(
        &mut self,
        job_name: impl Into<String>,
        parser: Arc<dyn SiteParser>,
        entity_kind: &str,
        task_kind: &str,
    ) -> Arc<StatsCrawler> {
        let crawler = Arc::new(StatsCrawler::new(
            parser,
            self.entities.clone(),
            self.failed_jobs.clone(),
            self.metrics.clone(),
            CrawlerConfig::new(entity_kind, task_kind).with_settings(self.config.crawl.clone()),
        ));

        self.register_job(job_name, Arc::new(CrawlJob::new(crawler.clone())));
        let retry = Arc::new(CrawlRetryHandler::new(
            crawler.clone(),
            self.cancellation_token.child_token(),
        ));
        for job_type in retry.job_types() {
            self.register_source_retry_handler(job_type, retry.source(), retry.clone());
        }
        crawler
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    fn warn_missing_handlers(&self) {
        for job in self.scheduler.missing_handlers() {
            warn!(job, "Job is enabled but no handler is registered, it will not run");
        }
    }

    /// One synchronous pass over every enabled job, bypassing cron and locks.
    pub async fn run_once(&self) -> RunOnceReport {
        self.scheduler.run_once().await
    }

    /// Start the scheduler and the retry worker.
    pub fn start(self) -> Result<RunningServices> {
        self.warn_missing_handlers();

        let scheduler = Arc::new(self.scheduler);
        scheduler.start()?;

        let retry_worker = Arc::new(self.retry_worker);
        let retry_handle = retry_worker.start_background_task(self.cancellation_token.child_token());

        info!(
            instance = %self.config.instance_id,
            jobs = scheduler.jobs().len(),
            "Services started"
        );
        Ok(RunningServices {
            pool: self.pool,
            metrics: self.metrics,
            scheduler,
            retry_handle,
            shutdown_timeout: self.config.shutdown_timeout,
            cancellation_token: self.cancellation_token,
        })
    }
}

/// Started services; consumed by [`RunningServices::shutdown`].
pub struct RunningServices {
    pool: SqlitePool,
    metrics: Arc<MetricsCollector>,
    scheduler: Arc<Scheduler>,
    retry_handle: JoinHandle<()>,
    shutdown_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl RunningServices {
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Cancel the root token, drain the scheduler and release this instance's
    /// locks, stop the retry worker, then close the pool.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        let stopped = self.scheduler.stop().await;

        let mut retry_handle = self.retry_handle;
        match tokio::time::timeout(self.shutdown_timeout, &mut retry_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Retry worker ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Retry worker did not stop before shutdown timeout, aborting it"
                );
                retry_handle.abort();
            }
        }

        info!("Closing database pool...");
        self.pool.close().await;

        let released = stopped?;
        info!(released, "Services shut down");
        Ok(())
    }
}

fn cleanup_handler(
    store: Arc<SqlxFailedJobStore>,
    retention: Duration,
) -> Arc<dyn JobHandler> {
    let retention_ms = duration_to_ms(retention);
    handler_fn(move |_ctx| {
        let store = store.clone();
        async move {
            let cutoff = now_ms().saturating_sub(retention_ms);
            let removed = store.cleanup(cutoff).await?;
            info!(removed, retention_days = retention_ms / 86_400_000, "Purged old failed jobs");
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::NewFailedJob;
    use crate::database::test_support::migrated_pool;
    use crate::crawl::test_support::FakeSite;
    use crate::scheduler::JobDefinition;

    fn config() -> AppConfig {
        AppConfig {
            instance_id: "test-instance".into(),
            failed_job_retention: Duration::from_secs(24 * 60 * 60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_once_purges_old_failed_jobs() {
        let (pool, _dir) = migrated_pool().await;
        let jobs = JobsConfig {
            jobs: vec![JobDefinition::new(FAILED_JOBS_CLEANUP_JOB, "0 0 3 * * *")],
        };
        let container = ServiceContainer::with_pool(pool, config(), jobs).unwrap();

        let now = now_ms();
        let day = 24 * 60 * 60 * 1000;
        container
            .failed_jobs
            .enqueue(&NewFailedJob::new("team", "site", "old", "", "boom"), now - 3 * day)
            .await
            .unwrap();
        container
            .failed_jobs
            .enqueue(&NewFailedJob::new("team", "site", "new", "", "boom"), now)
            .await
            .unwrap();

        let report = container.run_once().await;
        assert_eq!(report.succeeded, vec![FAILED_JOBS_CLEANUP_JOB.to_string()]);
        assert!(container.failed_jobs.find("team", "site", "old").await.unwrap().is_none());
        assert!(container.failed_jobs.find("team", "site", "new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_then_shutdown_closes_pool() {
        let (pool, _dir) = migrated_pool().await;
        let jobs = JobsConfig {
            jobs: vec![JobDefinition::new(FAILED_JOBS_CLEANUP_JOB, "0 0 3 * * *")],
        };
        let container = ServiceContainer::with_pool(pool.clone(), config(), jobs).unwrap();
        let running = container.start().unwrap();
        assert!(!running.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(5), running.shutdown())
            .await
            .expect("shutdown hung")
            .unwrap();

        assert!(pool.is_closed());
    }

    #[tokio::test]
    async fn test_failed_jobs_reach_the_crawler_of_their_source() {
        let (pool, _dir) = migrated_pool().await;
        let mut container =
            ServiceContainer::with_pool(pool, config(), JobsConfig::default()).unwrap();
        let site_a = Arc::new(FakeSite::default().with_source("site-a"));
        let site_b = Arc::new(FakeSite::default().with_source("site-b"));
        container.register_crawler("crawl-a", site_a.clone(), "tournament", "stats");
        container.register_crawler("crawl-b", site_b.clone(), "tournament", "stats");

        let day = 24 * 60 * 60 * 1000;
        let enqueued_at = now_ms() - day;
        for source in ["site-a", "site-b"] {
            container
                .failed_jobs
                .enqueue(&NewFailedJob::new("team", source, "bears", "", "503"), enqueued_at)
                .await
                .unwrap();
        }

        let report = container.retry_worker.process_at(now_ms()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(site_a.calls_matching("team:bears"), 1);
        assert_eq!(site_b.calls_matching("team:bears"), 1);
        assert!(container.failed_jobs.find("team", "site-a", "bears").await.unwrap().is_none());
        assert!(container.failed_jobs.find("team", "site-b", "bears").await.unwrap().is_none());
    }

    /// Ignores every signal.
    struct StuckRetry;

    #[async_trait::async_trait]
    impl RetryHandler for StuckRetry {
        async fn retry(&self, _job: &crate::database::models::FailedJob) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_not_blocked_by_a_hung_retry() {
        let (pool, _dir) = migrated_pool().await;
        let mut container =
            ServiceContainer::with_pool(pool.clone(), config(), JobsConfig::default()).unwrap();
        container.register_retry_handler("team", Arc::new(StuckRetry));
        container
            .failed_jobs
            .enqueue(&NewFailedJob::new("team", "site", "stuck", "", "503"), 0)
            .await
            .unwrap();

        let running = container.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tokio::time::timeout(Duration::from_secs(5), running.shutdown())
            .await
            .expect("shutdown waited on a hung retry")
            .unwrap();
        assert!(pool.is_closed());
    }
}
