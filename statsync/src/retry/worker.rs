//! Periodic sweep over due failed jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::models::FailedJob;
use crate::database::repositories::FailedJobStore;
use crate::database::time::now_ms;
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// Replays one family of failed jobs (one `job_type`).
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, job: &FailedJob) -> Result<()>;
}

/// Configuration for the retry worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Maximum due rows loaded per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Upper bound on a single replay; hitting it counts as a failed attempt.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }
}

fn default_interval_secs() -> u64 {
    300
}

fn default_batch_size() -> i64 {
    50
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrySweepReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// No handler registered for the row's job type and source.
    pub skipped: usize,
}

/// Handler lookup key. `source: None` matches every source.
type HandlerKey = (String, Option<String>);

pub struct RetryWorker {
    config: RetryConfig,
    store: Arc<dyn FailedJobStore>,
    handlers: HashMap<HandlerKey, Arc<dyn RetryHandler>>,
    metrics: Arc<MetricsCollector>,
}

impl RetryWorker {
    pub fn new(
        config: RetryConfig,
        store: Arc<dyn FailedJobStore>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            store,
            handlers: HashMap::new(),
            metrics,
        }
    }

    /// Register the handler for `job_type` rows of any source, replacing any
    /// previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn RetryHandler>) {
        self.insert((job_type.into(), None), handler);
    }

    /// Register the handler for `job_type` rows of one `source`. Takes
    /// precedence over a handler registered for every source.
    pub fn register_for_source(
        &mut self,
        job_type: impl Into<String>,
        source: impl Into<String>,
        handler: Arc<dyn RetryHandler>,
    ) {
        self.insert((job_type.into(), Some(source.into())), handler);
    }

    fn insert(&mut self, key: HandlerKey, handler: Arc<dyn RetryHandler>) {
        if self.handlers.insert(key.clone(), handler).is_some() {
            warn!(job_type = %key.0, source = ?key.1, "Replacing retry handler");
        }
    }

    fn handler_for(&self, job: &FailedJob) -> Option<&Arc<dyn RetryHandler>> {
        self.handlers
            .get(&(job.job_type.clone(), Some(job.source.clone())))
            .or_else(|| self.handlers.get(&(job.job_type.clone(), None)))
    }

    /// Run one sweep now.
    pub async fn process(&self) -> Result<RetrySweepReport> {
        self.sweep(now_ms(), &CancellationToken::new()).await
    }

    /// Run one sweep as if the clock read `now_ms`.
    pub async fn process_at(&self, now_ms: i64) -> Result<RetrySweepReport> {
        self.sweep(now_ms, &CancellationToken::new()).await
    }

    /// One replay under the attempt timeout. `None` when `cancel` fired first.
    async fn attempt(
        &self,
        handler: &Arc<dyn RetryHandler>,
        job: &FailedJob,
        cancel: &CancellationToken,
    ) -> Option<Result<()>> {
        let timeout = self.config.attempt_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = tokio::time::timeout(timeout, handler.retry(job)) => Some(
                res.unwrap_or_else(|_| {
                    Err(Error::JobTimeout {
                        job: format!("retry of {} {}", job.job_type, job.external_id),
                        timeout_secs: timeout.as_secs(),
                    })
                }),
            ),
        }
    }

    /// Sweep due rows, stopping early once `cancel` fires. An interrupted
    /// replay leaves its row untouched.
    async fn sweep(&self, now_ms: i64, cancel: &CancellationToken) -> Result<RetrySweepReport> {
        let due = self.store.list_due(now_ms, self.config.batch_size).await?;
        let mut report = RetrySweepReport {
            due: due.len(),
            ..Default::default()
        };

        for job in &due {
            let Some(handler) = self.handler_for(job) else {
                warn!(
                    id = job.id,
                    job_type = %job.job_type,
                    source = %job.source,
                    "No retry handler registered, leaving failed job in place"
                );
                report.skipped += 1;
                continue;
            };

            let Some(outcome) = self.attempt(handler, job, cancel).await else {
                info!(id = job.id, "Retry sweep interrupted by shutdown");
                break;
            };

            match outcome {
                Ok(()) => {
                    self.store.mark_succeeded(job.id).await?;
                    self.metrics.record_retry_outcome(true);
                    report.succeeded += 1;
                    info!(
                        id = job.id,
                        job_type = %job.job_type,
                        external_id = %job.external_id,
                        attempt = job.retry_count + 1,
                        "Failed job recovered"
                    );
                }
                Err(e) => {
                    let updated = self.store.mark_failed(job, &e.to_string(), now_ms).await?;
                    self.metrics.record_retry_outcome(false);
                    report.failed += 1;

                    let attempts = job.retry_count + 1;
                    if !updated {
                        debug!(id = job.id, "Failed job changed concurrently, not rescheduled");
                    } else if attempts >= job.max_retries {
                        warn!(
                            id = job.id,
                            job_type = %job.job_type,
                            external_id = %job.external_id,
                            attempts,
                            error = %e,
                            "Failed job exhausted its retries"
                        );
                    } else {
                        debug!(
                            id = job.id,
                            job_type = %job.job_type,
                            attempts,
                            error = %e,
                            "Retry failed, rescheduled"
                        );
                    }
                }
            }
        }

        let dead = self.store.count_dead().await?;
        self.metrics
            .set_dead_letters(u64::try_from(dead).unwrap_or_default());

        if report.due > 0 {
            info!(
                due = report.due,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                dead,
                "Retry sweep completed"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval_secs` until `cancellation_token` fires.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval_secs,
            batch_size = self.config.batch_size,
            "Retry worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Retry worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(now_ms(), &cancellation_token).await {
                        error!("Retry sweep failed: {}", e);
                    }
                }
            }
        }
    }

    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancellation_token).await })
    }
}
