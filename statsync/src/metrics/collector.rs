//! Metrics collector implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

fn bump(map: &DashMap<String, AtomicU64>, key: &str, by: u64) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(by, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(by, Ordering::Relaxed);
}

fn read(map: &DashMap<String, AtomicU64>) -> HashMap<String, u64> {
    map.iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect()
}

fn read_one(map: &DashMap<String, AtomicU64>, key: &str) -> u64 {
    map.get(key).map(|v| v.load(Ordering::Relaxed)).unwrap_or(0)
}

/// Metrics collector for the crawl orchestration engine.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    // Scheduler, keyed by job name
    job_success: DashMap<String, AtomicU64>,
    job_failure: DashMap<String, AtomicU64>,
    job_duration_total_ms: DashMap<String, AtomicU64>,
    job_last_duration_ms: DashMap<String, AtomicU64>,
    lock_contention: DashMap<String, AtomicU64>,
    // Keyed by "<job>/<kind>"
    job_errors: DashMap<String, AtomicU64>,

    // Crawl
    stale_processed: DashMap<String, AtomicU64>,
    records_persisted: DashMap<String, AtomicU64>,
    domains_skipped: AtomicU64,

    // Failed jobs
    failed_jobs_enqueued: DashMap<String, AtomicU64>,
    retry_succeeded: AtomicU64,
    retry_failed: AtomicU64,
    dead_letters: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Scheduler ==========

    /// Record one finished job run.
    pub fn record_job_run(&self, job: &str, success: bool, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        if success {
            bump(&self.job_success, job, 1);
        } else {
            bump(&self.job_failure, job, 1);
        }
        bump(&self.job_duration_total_ms, job, ms);
        self.job_last_duration_ms
            .entry(job.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(ms, Ordering::Relaxed);
    }

    pub fn record_job_error(&self, job: &str, kind: &str) {
        bump(&self.job_errors, &format!("{job}/{kind}"), 1);
    }

    /// A tick was skipped because another owner holds the job lock.
    pub fn record_lock_contention(&self, job: &str) {
        bump(&self.lock_contention, job, 1);
    }

    pub fn job(&self, job: &str) -> JobMetrics {
        JobMetrics {
            success: read_one(&self.job_success, job),
            failure: read_one(&self.job_failure, job),
            duration_total_ms: read_one(&self.job_duration_total_ms, job),
            last_duration_ms: read_one(&self.job_last_duration_ms, job),
            contention: read_one(&self.lock_contention, job),
        }
    }

    pub fn job_errors(&self, job: &str, kind: &str) -> u64 {
        read_one(&self.job_errors, &format!("{job}/{kind}"))
    }

    // ========== Crawl ==========

    pub fn record_stale_processed(&self, source: &str, count: u64) {
        bump(&self.stale_processed, source, count);
    }

    pub fn record_records_persisted(&self, record_type: &str, count: u64) {
        bump(&self.records_persisted, record_type, count);
    }

    pub fn record_domain_skipped(&self) {
        self.domains_skipped.fetch_add(1, Ordering::Relaxed);
    }

    // ========== Failed jobs ==========

    pub fn record_failed_job_enqueued(&self, job_type: &str) {
        bump(&self.failed_jobs_enqueued, job_type, 1);
    }

    pub fn record_retry_outcome(&self, success: bool) {
        let counter = if success {
            &self.retry_succeeded
        } else {
            &self.retry_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_dead_letters(&self, count: u64) {
        self.dead_letters.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            job_success: read(&self.job_success),
            job_failure: read(&self.job_failure),
            job_duration_total_ms: read(&self.job_duration_total_ms),
            job_last_duration_ms: read(&self.job_last_duration_ms),
            lock_contention: read(&self.lock_contention),
            job_errors: read(&self.job_errors),
            stale_processed: read(&self.stale_processed),
            records_persisted: read(&self.records_persisted),
            domains_skipped: self.domains_skipped.load(Ordering::Relaxed),
            failed_jobs_enqueued: read(&self.failed_jobs_enqueued),
            retry_succeeded: self.retry_succeeded.load(Ordering::Relaxed),
            retry_failed: self.retry_failed.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}

/// Per-job view of the scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub success: u64,
    pub failure: u64,
    pub duration_total_ms: u64,
    pub last_duration_ms: u64,
    pub contention: u64,
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub job_success: HashMap<String, u64>,
    pub job_failure: HashMap<String, u64>,
    pub job_duration_total_ms: HashMap<String, u64>,
    pub job_last_duration_ms: HashMap<String, u64>,
    pub lock_contention: HashMap<String, u64>,
    /// Keyed by `"<job>/<error kind>"`.
    pub job_errors: HashMap<String, u64>,

    pub stale_processed: HashMap<String, u64>,
    pub records_persisted: HashMap<String, u64>,
    pub domains_skipped: u64,

    pub failed_jobs_enqueued: HashMap<String, u64>,
    pub retry_succeeded: u64,
    pub retry_failed: u64,
    pub dead_letters: u64,
}
