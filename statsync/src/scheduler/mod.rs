//! Job scheduling.
//!
//! Jobs are declared in configuration ([`JobDefinition`]) and bound to code
//! through [`JobHandler`]s registered by name. The [`Scheduler`] drives them
//! from cron expressions under the job lock.

mod handler;
mod job;
mod service;

pub use handler::{FnJobHandler, JobContext, JobHandler, handler_fn};
pub use job::{JobDefinition, parse_cron, validate_jobs};
pub use service::{RunOnceReport, RunOutcome, Scheduler, SchedulerConfig};
