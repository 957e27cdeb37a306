//! Process configuration.
//!
//! [`AppConfig`] is read from the environment (after `.env` is loaded) and
//! may be overridden from the command line ([`Cli`]). Job definitions live
//! in a separate JSON file ([`JobsConfig`]).

mod jobs;

pub use jobs::JobsConfig;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::retry::RetryConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:statsync.db?mode=rwc";
pub const DEFAULT_JOBS_FILE: &str = "jobs.json";

/// Command-line flags.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "statsync", version, about = "Incremental sports statistics re-crawler")]
pub struct Cli {
    /// Job definitions file (JSON).
    #[arg(long, value_name = "FILE")]
    pub jobs: Option<PathBuf>,

    /// SQLite database URL.
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Run every enabled job once, without cron or locking, then exit.
    #[arg(long)]
    pub run_once: bool,

    /// Directory for rolling log files.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Lock owner identity of this instance.
    #[arg(long, value_name = "ID")]
    pub instance_id: Option<String>,
}

/// Worker counts and fetch behaviour of the crawl pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSettings {
    pub domain_workers: usize,
    pub tournament_workers: usize,
    pub team_workers: usize,
    pub task_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            domain_workers: 2,
            tournament_workers: 4,
            team_workers: 8,
            task_timeout: Duration::from_secs(120),
            fetch_attempts: 3,
            fetch_retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub instance_id: String,
    pub jobs_file: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub run_once: bool,
    pub retry: RetryConfig,
    /// Failed jobs older than this are purged by the cleanup job.
    pub failed_job_retention: Duration,
    pub crawl: CrawlSettings,
    pub lock_grace: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            instance_id: generate_instance_id(),
            jobs_file: PathBuf::from(DEFAULT_JOBS_FILE),
            log_dir: None,
            run_once: false,
            retry: RetryConfig::default(),
            failed_job_retention: Duration::from_secs(30 * 24 * 60 * 60),
            crawl: CrawlSettings::default(),
            lock_grace: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

pub fn generate_instance_id() -> String {
    format!("instance-{}", uuid::Uuid::new_v4())
}

fn parse_var<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(format!("invalid {key}={value}: {e}"))),
    }
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(Error::config(format!("failed to load .env: {e}")));
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key);

        if let Some(url) = parse_var::<String>("DATABASE_URL", get("DATABASE_URL"))? {
            config.database_url = url;
        }
        if let Some(id) = parse_var::<String>("STATSYNC_INSTANCE_ID", get("STATSYNC_INSTANCE_ID"))? {
            config.instance_id = id;
        }
        if let Some(path) = parse_var::<PathBuf>("STATSYNC_JOBS_FILE", get("STATSYNC_JOBS_FILE"))? {
            config.jobs_file = path;
        }
        config.log_dir = parse_var::<PathBuf>("STATSYNC_LOG_DIR", get("STATSYNC_LOG_DIR"))?;

        if let Some(secs) = parse_var::<u64>(
            "STATSYNC_RETRY_INTERVAL_SECS",
            get("STATSYNC_RETRY_INTERVAL_SECS"),
        )? {
            config.retry.interval_secs = secs;
        }
        if let Some(size) =
            parse_var::<i64>("STATSYNC_RETRY_BATCH_SIZE", get("STATSYNC_RETRY_BATCH_SIZE"))?
        {
            config.retry.batch_size = size;
        }
        if let Some(secs) = parse_var::<u64>(
            "STATSYNC_RETRY_TIMEOUT_SECS",
            get("STATSYNC_RETRY_TIMEOUT_SECS"),
        )? {
            config.retry.attempt_timeout_secs = secs;
        }
        if let Some(days) = parse_var::<u64>(
            "STATSYNC_FAILED_JOB_RETENTION_DAYS",
            get("STATSYNC_FAILED_JOB_RETENTION_DAYS"),
        )? {
            config.failed_job_retention = Duration::from_secs(days * 24 * 60 * 60);
        }

        let crawl = &mut config.crawl;
        if let Some(n) = parse_var::<usize>("STATSYNC_DOMAIN_WORKERS", get("STATSYNC_DOMAIN_WORKERS"))? {
            crawl.domain_workers = n;
        }
        if let Some(n) = parse_var::<usize>(
            "STATSYNC_TOURNAMENT_WORKERS",
            get("STATSYNC_TOURNAMENT_WORKERS"),
        )? {
            crawl.tournament_workers = n;
        }
        if let Some(n) = parse_var::<usize>("STATSYNC_TEAM_WORKERS", get("STATSYNC_TEAM_WORKERS"))? {
            crawl.team_workers = n;
        }
        if let Some(secs) = parse_var::<u64>(
            "STATSYNC_TASK_TIMEOUT_SECS",
            get("STATSYNC_TASK_TIMEOUT_SECS"),
        )? {
            crawl.task_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>("STATSYNC_FETCH_ATTEMPTS", get("STATSYNC_FETCH_ATTEMPTS"))? {
            crawl.fetch_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(
            "STATSYNC_FETCH_RETRY_DELAY_MS",
            get("STATSYNC_FETCH_RETRY_DELAY_MS"),
        )? {
            crawl.fetch_retry_delay = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Command-line flags win over the environment.
    pub fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(jobs) = &cli.jobs {
            self.jobs_file = jobs.clone();
        }
        if let Some(url) = &cli.database_url {
            self.database_url = url.clone();
        }
        if let Some(dir) = &cli.log_dir {
            self.log_dir = Some(dir.clone());
        }
        if let Some(id) = &cli.instance_id {
            self.instance_id = id.clone();
        }
        self.run_once |= cli.run_once;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let crawl = &self.crawl;
        if crawl.domain_workers == 0 || crawl.tournament_workers == 0 || crawl.team_workers == 0 {
            return Err(Error::config("worker counts must be at least 1"));
        }
        if crawl.fetch_attempts == 0 {
            return Err(Error::config("STATSYNC_FETCH_ATTEMPTS must be at least 1"));
        }
        if crawl.task_timeout.is_zero() {
            return Err(Error::config("STATSYNC_TASK_TIMEOUT_SECS must be non-zero"));
        }
        if self.retry.batch_size <= 0 {
            return Err(Error::config("STATSYNC_RETRY_BATCH_SIZE must be positive"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(Error::config("instance id must not be empty"));
        }
        Ok(())
    }
}
