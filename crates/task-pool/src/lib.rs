//! # Task Pool
//!
//! A generic bounded-concurrency executor: a fixed number of workers drain a
//! task queue into a result queue. The same executor is instantiated at every
//! crawl granularity (domain, tournament, team), parameterised over the task
//! payload and result types.
//!
//! ## Guarantees
//!
//! - Every submitted task produces exactly one [`TaskResult`], unless the
//!   executor is cancelled before the task is picked up.
//! - A failing, panicking or hanging task is converted into a result carrying
//!   a [`TaskError`]; siblings and the pool itself are unaffected.
//! - No ordering among results of one batch.
//!
//! ## License
//!
//! Licensed under either of MIT or Apache-2.0, at your option.

use std::time::Duration;

use thiserror::Error;

mod executor;
mod task;

pub use executor::{ExecutorConfig, TaskExecutor, panic_message};
pub use task::{FnHandler, Task, TaskHandler, TaskResult};

/// Boxed error returned by task handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a single task did not produce an output.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(#[source] BoxError),
}

impl TaskError {
    /// Short label, suitable as a metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panic",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors from driving the executor itself (as opposed to task failures).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor has not been started")]
    NotStarted,

    #[error("executor is closed for new tasks")]
    Closed,
}
