//! Application services.

pub mod container;

pub use container::{FAILED_JOBS_CLEANUP_JOB, RunningServices, ServiceContainer};
