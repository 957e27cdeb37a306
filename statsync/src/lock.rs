//! Job-level mutual exclusion.
//!
//! A [`Locker`] hands out TTL-bounded locks keyed by job name. Contention is
//! reported as `Ok(false)`, never as an error; only storage failures are
//! errors. The SQLite-backed implementation lives in
//! [`crate::database::repositories::SqlxLocker`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;
use crate::database::models::JobLockDbModel;
use crate::database::time::{duration_to_ms, now_ms};

#[async_trait]
pub trait Locker: Send + Sync {
    /// Take the lock for `job_name` unless another owner holds a valid one.
    ///
    /// Insert-or-takeover is a single atomic step. An expired lock is taken
    /// over regardless of its previous owner. Returns `true` iff `owner_id`
    /// holds the lock afterwards.
    async fn try_acquire(&self, job_name: &str, ttl: Duration, owner_id: &str) -> Result<bool>;

    /// Drop the lock if, and only if, `owner_id` still holds it.
    async fn release(&self, job_name: &str, owner_id: &str) -> Result<()>;

    /// Drop every lock held by `owner_id`. Returns how many were removed.
    async fn release_all(&self, owner_id: &str) -> Result<u64>;
}

/// Process-local [`Locker`].
///
/// Only excludes callers sharing the same instance; useful for tests and
/// for single-process deployments without a shared store.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    locks: Mutex<HashMap<String, JobLockDbModel>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `job_name`, if its lock is still valid.
    pub fn holder(&self, job_name: &str) -> Option<String> {
        let now = now_ms();
        self.locks
            .lock()
            .get(job_name)
            .filter(|lock| lock.is_valid_at(now))
            .map(|lock| lock.owner_id.clone())
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn try_acquire(&self, job_name: &str, ttl: Duration, owner_id: &str) -> Result<bool> {
        let now = now_ms();
        let mut locks = self.locks.lock();

        if locks.get(job_name).is_some_and(|lock| lock.is_valid_at(now)) {
            return Ok(false);
        }

        locks.insert(
            job_name.to_string(),
            JobLockDbModel {
                job_name: job_name.to_string(),
                locked_at: now,
                locked_until: now.saturating_add(duration_to_ms(ttl)),
                owner_id: owner_id.to_string(),
            },
        );
        Ok(true)
    }

    async fn release(&self, job_name: &str, owner_id: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        if locks
            .get(job_name)
            .is_some_and(|lock| lock.owner_id == owner_id)
        {
            locks.remove(job_name);
        }
        Ok(())
    }

    async fn release_all(&self, owner_id: &str) -> Result<u64> {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, lock| lock.owner_id != owner_id);
        Ok((before - locks.len()) as u64)
    }
}
