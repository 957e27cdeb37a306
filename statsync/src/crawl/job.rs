//! Adapters binding a [`StatsCrawler`] to the scheduler and the retry worker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::crawler::{StatsCrawler, TEAM_JOB_TYPE};
use crate::database::models::FailedJob;
use crate::retry::RetryHandler;
use crate::scheduler::{JobContext, JobHandler};
use crate::{Error, Result};

/// Scheduled crawl of one source.
pub struct CrawlJob {
    crawler: Arc<StatsCrawler>,
}

impl CrawlJob {
    pub fn new(crawler: Arc<StatsCrawler>) -> Self {
        Self { crawler }
    }
}

#[async_trait]
impl JobHandler for CrawlJob {
    async fn run(&self, ctx: JobContext) -> Result<()> {
        let report = self.crawler.run(&ctx.cancel, ctx.max_batch_size).await?;
        info!(
            job = %ctx.job,
            source = %self.crawler.source(),
            processed = report.processed,
            failed = report.failed,
            "Crawl job done"
        );
        Ok(())
    }
}

/// Replays failed entity and team crawls for one source. Register it per
/// source with [`crate::retry::RetryWorker::register_for_source`].
pub struct CrawlRetryHandler {
    crawler: Arc<StatsCrawler>,
    cancel: CancellationToken,
}

impl CrawlRetryHandler {
    pub fn new(crawler: Arc<StatsCrawler>, cancel: CancellationToken) -> Self {
        Self { crawler, cancel }
    }

    pub fn source(&self) -> &str {
        self.crawler.source()
    }

    /// Job types this handler understands.
    pub fn job_types(&self) -> [String; 2] {
        [
            self.crawler.config().entity_kind.clone(),
            TEAM_JOB_TYPE.to_string(),
        ]
    }
}

#[async_trait]
impl RetryHandler for CrawlRetryHandler {
    async fn retry(&self, job: &FailedJob) -> Result<()> {
        if job.source != self.crawler.source() {
            return Err(Error::Other(format!(
                "failed job {} belongs to source {}, not {}",
                job.id,
                job.source,
                self.crawler.source()
            )));
        }

        if job.job_type == TEAM_JOB_TYPE {
            self.crawler.retry_team(job, &self.cancel).await
        } else if job.job_type == self.crawler.config().entity_kind {
            self.crawler.retry_entity(job, &self.cancel).await
        } else {
            Err(Error::Other(format!(
                "unsupported failed job type: {}",
                job.job_type
            )))
        }
    }
}
