//! Job definitions and cron parsing.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One scheduled job, loaded from configuration and immutable during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    /// 5-field (minute resolution) or 6/7-field (with seconds) expression.
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Caps how many stale entities one run may pick up.
    #[serde(default)]
    pub max_batch_size: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    3600
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, cron: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cron: cron.into(),
            enabled: default_enabled(),
            timeout_secs: default_timeout_secs(),
            max_batch_size: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn schedule(&self) -> Result<Schedule> {
        parse_cron(&self.cron)
    }
}

/// Parse a cron expression, accepting the classic 5-field form by pinning
/// the seconds field to `0`.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(Error::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5, 6 or 7 fields, found {n}"),
            });
        }
    };

    Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Reject duplicate names, empty names, zero timeouts and bad cron expressions.
pub fn validate_jobs(jobs: &[JobDefinition]) -> Result<()> {
    let mut names = HashSet::new();
    for job in jobs {
        if job.name.trim().is_empty() {
            return Err(Error::config("job name must not be empty"));
        }
        if !names.insert(job.name.as_str()) {
            return Err(Error::config(format!("duplicate job name '{}'", job.name)));
        }
        if job.timeout_secs == 0 {
            return Err(Error::config(format!(
                "job '{}' must have a non-zero timeout",
                job.name
            )));
        }
        job.schedule()?;
    }
    Ok(())
}
