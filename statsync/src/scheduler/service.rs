//! Cron-driven job runner.
//!
//! Every enabled job gets its own trigger loop. A firing spawns a guarded
//! run: take the job lock, invoke the handler under the job's timeout,
//! release the lock, record metrics. A firing that finds the lock held by
//! anyone (including an earlier run of this instance) is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use cron::Schedule;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::handler::{JobContext, JobHandler};
use super::job::{JobDefinition, validate_jobs};
use crate::lock::Locker;
use crate::metrics::MetricsCollector;
use crate::{Error, Result};

/// Scheduler settings that are not per job.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identity written into lock rows.
    pub owner_id: String,
    /// Added to a job's timeout to form the lock TTL, so a lock never
    /// expires while its run may still be inside the timeout window.
    pub lock_grace: Duration,
    /// How long `stop` waits for in-flight runs.
    pub shutdown_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            lock_grace: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

/// How a guarded run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
    /// Lock held elsewhere; nothing ran.
    Contended,
}

/// Result of [`Scheduler::run_once`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunOnceReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Vec<JobDefinition>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    locker: Arc<dyn Locker>,
    metrics: Arc<MetricsCollector>,
    /// Stops trigger loops only; in-flight runs keep going.
    triggers: CancellationToken,
    /// Parent of every run context; follows the root token.
    runs: CancellationToken,
    tracker: TaskTracker,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler for `jobs`. Invalid definitions are rejected here so
    /// that a bad configuration fails at startup.
    pub fn new(
        config: SchedulerConfig,
        jobs: Vec<JobDefinition>,
        locker: Arc<dyn Locker>,
        metrics: Arc<MetricsCollector>,
        root: &CancellationToken,
    ) -> Result<Self> {
        validate_jobs(&jobs)?;
        Ok(Self {
            config,
            jobs,
            handlers: HashMap::new(),
            locker,
            metrics,
            triggers: root.child_token(),
            runs: root.child_token(),
            tracker: TaskTracker::new(),
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn register_handler(&mut self, job_name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_name = job_name.into();
        if !self.jobs.iter().any(|j| j.name == job_name) {
            debug!(job = %job_name, "Handler registered for a job that is not configured");
        }
        self.handlers.insert(job_name, handler);
    }

    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    pub fn jobs(&self) -> &[JobDefinition] {
        &self.jobs
    }

    /// Enabled jobs that have no registered handler.
    pub fn missing_handlers(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.enabled && !self.handlers.contains_key(&j.name))
            .map(|j| j.name.as_str())
            .collect()
    }

    /// Launch one trigger loop per enabled job that has a handler.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Other("scheduler already started".into()));
        }

        for name in self.missing_handlers() {
            warn!(job = name, "Job is enabled but has no registered handler, skipping");
        }

        let mut loops = Vec::new();
        for job in self.jobs.iter().filter(|j| j.enabled) {
            let Some(handler) = self.handlers.get(&job.name).cloned() else {
                continue;
            };
            let schedule = job.schedule()?;
            let this = Arc::clone(self);
            let job = job.clone();
            info!(job = %job.name, cron = %job.cron, timeout_secs = job.timeout_secs, "Scheduling job");
            loops.push(tokio::spawn(async move {
                this.trigger_loop(job, schedule, handler).await;
            }));
        }

        info!(
            jobs = loops.len(),
            owner = %self.config.owner_id,
            "Scheduler started"
        );
        self.loops.lock().extend(loops);
        Ok(())
    }

    async fn trigger_loop(
        self: Arc<Self>,
        job: JobDefinition,
        schedule: Schedule,
        handler: Arc<dyn JobHandler>,
    ) {
        let mut last_fired = Utc::now();
        loop {
            let from = last_fired.max(Utc::now());
            let Some(next) = schedule.after(&from).next() else {
                warn!(job = %job.name, "Cron schedule has no upcoming fire time");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = self.triggers.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last_fired = next;

            debug!(job = %job.name, fire_time = %next, "Cron fired");
            let this = Arc::clone(&self);
            let job = job.clone();
            let handler = Arc::clone(&handler);
            self.tracker.spawn(async move {
                this.run_guarded(&job, handler).await;
            });
        }
        debug!(job = %job.name, "Trigger loop stopped");
    }

    /// One locked, timed, measured run of `job`.
    pub async fn run_guarded(&self, job: &JobDefinition, handler: Arc<dyn JobHandler>) -> RunOutcome {
        let owner = self.config.owner_id.as_str();
        let ttl = job.timeout() + self.config.lock_grace;

        match self.locker.try_acquire(&job.name, ttl, owner).await {
            Ok(true) => {}
            Ok(false) => {
                info!(job = %job.name, owner, "Job is already running elsewhere, skipping this tick");
                self.metrics.record_lock_contention(&job.name);
                return RunOutcome::Contended;
            }
            Err(e) => {
                error!(job = %job.name, error = %e, "Failed to acquire job lock");
                self.metrics.record_job_error(&job.name, e.kind());
                return RunOutcome::Failed;
            }
        }

        let started = Instant::now();
        let result = self.invoke(job, handler).await;
        let elapsed = started.elapsed();

        if let Err(e) = self.locker.release(&job.name, owner).await {
            warn!(job = %job.name, error = %e, "Failed to release job lock, it will expire on its own");
        }

        self.metrics.record_job_run(&job.name, result.is_ok(), elapsed);
        match result {
            Ok(()) => {
                info!(job = %job.name, duration_ms = elapsed.as_millis() as u64, "Job completed");
                RunOutcome::Succeeded
            }
            Err(e) => {
                self.metrics.record_job_error(&job.name, e.kind());
                error!(job = %job.name, duration_ms = elapsed.as_millis() as u64, error = %e, "Job failed");
                RunOutcome::Failed
            }
        }
    }

    /// Run the handler in its own task under the job timeout. A panic or a
    /// timeout becomes an error. On timeout the context is cancelled and the
    /// handler gets up to `lock_grace` to wind down, so it never outlives its
    /// lock; only then is it aborted.
    async fn invoke(&self, job: &JobDefinition, handler: Arc<dyn JobHandler>) -> Result<()> {
        let token = self.runs.child_token();
        let ctx = JobContext::new(job.name.clone(), token.clone())
            .with_max_batch_size(job.max_batch_size);
        let mut task = tokio::spawn(async move { handler.run(ctx).await });

        let joined = match tokio::time::timeout(job.timeout(), &mut task).await {
            Ok(joined) => return joined_result(&job.name, joined),
            Err(_) => {
                warn!(job = %job.name, timeout_secs = job.timeout_secs, "Job timed out, cancelling it");
                token.cancel();
                tokio::time::timeout(self.config.lock_grace, &mut task).await
            }
        };

        match joined {
            Ok(Ok(Ok(()))) => debug!(job = %job.name, "Timed-out job finished after cancellation"),
            Ok(joined) => {
                if let Err(e) = joined_result(&job.name, joined) {
                    debug!(job = %job.name, error = %e, "Timed-out job ended with an error");
                }
            }
            Err(_) => {
                warn!(job = %job.name, "Job ignored cancellation past the lock grace, aborting it");
                task.abort();
            }
        }
        Err(Error::JobTimeout {
            job: job.name.clone(),
            timeout_secs: job.timeout_secs,
        })
    }

    /// Run every enabled job once, in configuration order, without cron or
    /// locking. Failures are logged and do not stop the pass.
    pub async fn run_once(&self) -> RunOnceReport {
        let mut report = RunOnceReport::default();
        for name in self.missing_handlers() {
            warn!(job = name, "Job is enabled but has no registered handler, skipping");
        }

        for job in self.jobs.iter().filter(|j| j.enabled) {
            let Some(handler) = self.handlers.get(&job.name).cloned() else {
                continue;
            };

            info!(job = %job.name, "Running job once");
            let started = Instant::now();
            let result = self.invoke(job, handler).await;
            let elapsed = started.elapsed();
            self.metrics.record_job_run(&job.name, result.is_ok(), elapsed);

            match result {
                Ok(()) => {
                    info!(job = %job.name, duration_ms = elapsed.as_millis() as u64, "Job completed");
                    report.succeeded.push(job.name.clone());
                }
                Err(e) => {
                    self.metrics.record_job_error(&job.name, e.kind());
                    error!(job = %job.name, error = %e, "Job failed");
                    report.failed.push(job.name.clone());
                }
            }
        }
        report
    }

    /// Stop triggering, wait for in-flight runs (bounded by the shutdown
    /// timeout), then release every lock this instance still holds.
    pub async fn stop(&self) -> Result<u64> {
        self.triggers.cancel();
        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        for joined in join_all(loops).await {
            if let Err(e) = joined {
                warn!("Trigger loop ended abnormally: {}", e);
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "In-flight jobs did not finish before shutdown timeout, cancelling them"
            );
            self.runs.cancel();
        }

        let released = self.locker.release_all(&self.config.owner_id).await?;
        info!(owner = %self.config.owner_id, released, "Scheduler stopped");
        Ok(released)
    }
}

fn joined_result(job: &str, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::handler(
            job,
            format!("panicked: {}", task_pool::panic_message(e.into_panic())),
        )),
        Err(_) => Err(Error::handler(job, "handler task was cancelled")),
    }
}
