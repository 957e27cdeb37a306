//! Job lock row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of `job_lock`.
///
/// A row is *valid* while `locked_until` lies in the future.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobLockDbModel {
    pub job_name: String,
    pub locked_at: i64,
    pub locked_until: i64,
    pub owner_id: String,
}

impl JobLockDbModel {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.locked_until >= now_ms
    }
}
