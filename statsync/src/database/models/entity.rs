//! Crawl entity, progress and record rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;
use crate::priority::StaleEntity;

/// A crawlable unit as reported by a site parser, ready for upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredEntity {
    pub source: String,
    /// e.g. "tournament" or "season".
    pub entity_kind: String,
    pub external_id: String,
    pub url: String,
    pub name: Option<String>,
    pub ended: bool,
    pub end_marker: Option<DateTime<Utc>>,
}

impl DiscoveredEntity {
    pub fn new(
        source: impl Into<String>,
        entity_kind: impl Into<String>,
        external_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            entity_kind: entity_kind.into(),
            external_id: external_id.into(),
            url: url.into(),
            name: None,
            ended: false,
            end_marker: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn ended_at(mut self, end_marker: DateTime<Utc>) -> Self {
        self.ended = true;
        self.end_marker = Some(end_marker);
        self
    }

    /// Stable primary key, also the dedup identity.
    pub fn id(&self) -> String {
        entity_id(&self.source, &self.entity_kind, &self.external_id)
    }
}

pub fn entity_id(source: &str, entity_kind: &str, external_id: &str) -> String {
    format!("{source}:{entity_kind}:{external_id}")
}

/// `crawl_entity` joined with its `entity_progress` row for one task kind.
#[derive(Debug, Clone, FromRow)]
pub struct StaleEntityRow {
    pub id: String,
    pub source: String,
    pub entity_kind: String,
    pub external_id: String,
    pub url: String,
    pub name: Option<String>,
    pub ended: bool,
    pub end_marker: Option<i64>,
    pub last_processed_at: Option<i64>,
}

impl From<StaleEntityRow> for StaleEntity {
    fn from(row: StaleEntityRow) -> Self {
        StaleEntity {
            id: row.id,
            source: row.source,
            entity_kind: row.entity_kind,
            external_id: row.external_id,
            url: row.url,
            name: row.name,
            ended: row.ended,
            end_marker: row.end_marker.map(ms_to_datetime),
            last_processed_at: row.last_processed_at.map(ms_to_datetime),
        }
    }
}

/// One parsed statistics row destined for `crawl_record`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRecord {
    /// e.g. "player", "team_stats", "match".
    pub record_type: String,
    pub source: String,
    pub external_id: String,
    pub parent_id: Option<String>,
    pub payload: serde_json::Value,
}

impl CrawlRecord {
    pub fn new(
        record_type: impl Into<String>,
        source: impl Into<String>,
        external_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            source: source.into(),
            external_id: external_id.into(),
            parent_id: None,
            payload,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}
