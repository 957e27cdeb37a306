//! Site parser seam and inline fetch retry.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::database::models::{CrawlRecord, DiscoveredEntity};
use crate::priority::StaleEntity;

/// Errors raised by a [`SiteParser`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, resets, 5xx. Retried inline.
    #[error("transient fetch error: {0}")]
    Transient(String),

    /// The page was fetched but could not be understood. Never retried inline.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Which part of an upstream domain to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Most recently published entities only; used to sample the domain.
    Latest,
    Full,
}

/// A team page reached from a tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamRef {
    pub external_id: String,
    pub url: String,
    pub name: Option<String>,
}

/// What a parser is asked to fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlTarget {
    /// Listing of crawlable entities on one upstream domain.
    Domain { domain: String, segment: Segment },
    /// One tournament (or season) page.
    Entity(StaleEntity),
    /// One team page; `parent_id` is the owning entity id when known.
    Team {
        team: TeamRef,
        parent_id: Option<String>,
    },
}

impl CrawlTarget {
    pub fn describe(&self) -> String {
        match self {
            Self::Domain { domain, segment } => format!("domain {domain} ({segment:?})"),
            Self::Entity(entity) => format!("{} {}", entity.entity_kind, entity.external_id),
            Self::Team { team, .. } => format!("team {}", team.external_id),
        }
    }
}

/// One item extracted from a page.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedItem {
    Entity(DiscoveredEntity),
    Team(TeamRef),
    Record(CrawlRecord),
}

/// Per-site fetch and extraction.
#[async_trait]
pub trait SiteParser: Send + Sync {
    /// Source label stored on every row, e.g. "fbref".
    fn source(&self) -> &str;

    /// Upstream domains (mirrors, regional sites) serving this source.
    fn domains(&self) -> Vec<String>;

    async fn parse(&self, target: &CrawlTarget) -> Result<Vec<ParsedItem>, FetchError>;
}

/// Inline retry policy for transient fetch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for FetchRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl FetchRetry {
    /// Parse `target`, retrying transient failures up to `attempts` times
    /// with a fixed delay. The last error surfaces unchanged.
    pub async fn parse(
        &self,
        parser: &dyn SiteParser,
        target: &CrawlTarget,
        cancel: &CancellationToken,
    ) -> Result<Vec<ParsedItem>, FetchError> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            match parser.parse(target).await {
                Ok(items) => return Ok(items),
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(
                        target_desc = %target.describe(),
                        attempt,
                        attempts,
                        error = %e,
                        "Transient fetch error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
