//! Job definitions file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::scheduler::{JobDefinition, validate_jobs};
use crate::{Error, Result};

/// `{"jobs": [...]}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl JobsConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        validate_jobs(&config.jobs)?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("cannot read jobs file {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &JobDefinition> {
        self.jobs.iter().filter(|j| j.enabled)
    }
}
