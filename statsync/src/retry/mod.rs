//! Failed-job replay.
//!
//! Failures land in the [`FailedJobStore`](crate::database::repositories::FailedJobStore)
//! and are replayed by the [`RetryWorker`] on a fixed tiered backoff.

mod backoff;
mod worker;

pub use backoff::backoff;
pub use worker::{RetryConfig, RetryHandler, RetrySweepReport, RetryWorker};
