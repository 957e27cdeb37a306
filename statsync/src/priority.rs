//! Staleness tiers and stale-entity selection.
//!
//! An entity's tier is derived from whether it has ended and how long ago,
//! and decides how often it is re-scanned:
//!
//! | Tier    | Condition                         | Re-scan |
//! |---------|-----------------------------------|---------|
//! | Active  | not ended, or no end marker       | 4h      |
//! | Recent  | ended, end marker within 1 month  | 1d      |
//! | Medium  | ended, 1-6 months ago             | 14d     |
//! | Old     | ended, 6-12 months ago            | 30d     |
//! | Archive | ended, more than 12 months ago    | 180d    |
//!
//! Month boundaries are inclusive on the younger side: an entity that ended
//! exactly one month ago is still `Recent`.
//!
//! Selection order is tier rank ascending, then last pass ascending with
//! never-processed entities first, so the most neglected work is served
//! first within each tier.

use chrono::{DateTime, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::database::time::datetime_to_ms;

/// Staleness tier of a crawlable entity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Active,
    Recent,
    Medium,
    Old,
    Archive,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Active,
        Tier::Recent,
        Tier::Medium,
        Tier::Old,
        Tier::Archive,
    ];

    /// Sort rank, lower is served first.
    pub fn rank(self) -> i64 {
        match self {
            Tier::Active => 0,
            Tier::Recent => 1,
            Tier::Medium => 2,
            Tier::Old => 3,
            Tier::Archive => 4,
        }
    }

    pub fn rescan_interval(self) -> TimeDelta {
        match self {
            Tier::Active => TimeDelta::hours(4),
            Tier::Recent => TimeDelta::days(1),
            Tier::Medium => TimeDelta::days(14),
            Tier::Old => TimeDelta::days(30),
            Tier::Archive => TimeDelta::days(180),
        }
    }
}

/// Month offsets separating Recent/Medium, Medium/Old and Old/Archive.
const RECENT_MONTHS: u32 = 1;
const MEDIUM_MONTHS: u32 = 6;
const OLD_MONTHS: u32 = 12;

fn months_before(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Classify an entity into its staleness tier.
pub fn classify(ended: bool, end_marker: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Tier {
    let Some(end_marker) = end_marker.filter(|_| ended) else {
        return Tier::Active;
    };

    if end_marker >= months_before(now, RECENT_MONTHS) {
        Tier::Recent
    } else if end_marker >= months_before(now, MEDIUM_MONTHS) {
        Tier::Medium
    } else if end_marker >= months_before(now, OLD_MONTHS) {
        Tier::Old
    } else {
        Tier::Archive
    }
}

/// A crawlable unit (tournament, season, ...) as seen by the selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaleEntity {
    pub id: String,
    pub source: String,
    pub entity_kind: String,
    pub external_id: String,
    pub url: String,
    pub name: Option<String>,
    pub ended: bool,
    pub end_marker: Option<DateTime<Utc>>,
    /// Last successful pass for the task kind this entity was selected for.
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl StaleEntity {
    pub fn tier(&self, now: DateTime<Utc>) -> Tier {
        classify(self.ended, self.end_marker, now)
    }
}

/// Shape of one stale-selection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleQuery {
    pub source: String,
    pub entity_kind: String,
    /// Which `last_processed_at` column to consult ("players", "stats", ...).
    pub task_kind: String,
    /// Batch cap; overflow is left for the next run.
    pub limit: Option<usize>,
}

/// Bind values for [`STALE_SELECTION_SQL`], in placeholder order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleQueryParams {
    pub recent_cutoff_ms: i64,
    pub medium_cutoff_ms: i64,
    pub old_cutoff_ms: i64,
    pub task_kind: String,
    pub source: String,
    pub entity_kind: String,
    /// Per tier, in rank order: a pass older than this is stale.
    pub rescan_cutoffs_ms: [i64; 5],
    /// SQLite treats a negative LIMIT as unbounded.
    pub limit: i64,
}

/// Selection statement. The tier CASE mirrors [`classify`], the staleness
/// CASE mirrors [`Tier::rescan_interval`].
pub const STALE_SELECTION_SQL: &str = r#"
SELECT id, source, entity_kind, external_id, url, name, ended, end_marker, last_processed_at
FROM (
    SELECT e.id, e.source, e.entity_kind, e.external_id, e.url, e.name, e.ended, e.end_marker,
           p.last_processed_at,
           CASE
               WHEN e.ended = 0 OR e.end_marker IS NULL THEN 0
               WHEN e.end_marker >= ? THEN 1
               WHEN e.end_marker >= ? THEN 2
               WHEN e.end_marker >= ? THEN 3
               ELSE 4
           END AS tier_rank
    FROM crawl_entity e
    LEFT JOIN entity_progress p ON p.entity_id = e.id AND p.task_kind = ?
    WHERE e.source = ? AND e.entity_kind = ?
) AS candidate
WHERE last_processed_at IS NULL
   OR last_processed_at < CASE tier_rank
        WHEN 0 THEN ?
        WHEN 1 THEN ?
        WHEN 2 THEN ?
        WHEN 3 THEN ?
        ELSE ?
      END
ORDER BY tier_rank ASC, last_processed_at ASC NULLS FIRST, id ASC
LIMIT ?
"#;

impl StaleQuery {
    pub fn new(
        source: impl Into<String>,
        entity_kind: impl Into<String>,
        task_kind: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            entity_kind: entity_kind.into(),
            task_kind: task_kind.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `entity` is due for another pass at `now`.
    pub fn qualifies(entity: &StaleEntity, now: DateTime<Utc>) -> bool {
        match entity.last_processed_at {
            None => true,
            Some(last) => last < now - entity.tier(now).rescan_interval(),
        }
    }

    /// In-memory counterpart of [`STALE_SELECTION_SQL`].
    pub fn select(
        &self,
        entities: impl IntoIterator<Item = StaleEntity>,
        now: DateTime<Utc>,
    ) -> Vec<StaleEntity> {
        let mut due: Vec<(Tier, StaleEntity)> = entities
            .into_iter()
            .filter(|e| e.source == self.source && e.entity_kind == self.entity_kind)
            .filter(|e| Self::qualifies(e, now))
            .map(|e| (e.tier(now), e))
            .collect();

        // `None < Some(_)` gives NULLS FIRST.
        due.sort_by(|(ta, a), (tb, b)| {
            ta.cmp(tb)
                .then_with(|| a.last_processed_at.cmp(&b.last_processed_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut selected: Vec<StaleEntity> = due.into_iter().map(|(_, e)| e).collect();
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }

    pub fn params(&self, now: DateTime<Utc>) -> StaleQueryParams {
        let rescan_cutoffs_ms = Tier::ALL.map(|tier| datetime_to_ms(now - tier.rescan_interval()));

        StaleQueryParams {
            recent_cutoff_ms: datetime_to_ms(months_before(now, RECENT_MONTHS)),
            medium_cutoff_ms: datetime_to_ms(months_before(now, MEDIUM_MONTHS)),
            old_cutoff_ms: datetime_to_ms(months_before(now, OLD_MONTHS)),
            task_kind: self.task_kind.clone(),
            source: self.source.clone(),
            entity_kind: self.entity_kind.clone(),
            rescan_cutoffs_ms,
            limit: self
                .limit
                .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
                .unwrap_or(-1),
        }
    }
}
