//! statsync library crate.
//!
//! Crawl orchestration for sports statistics sites: cron scheduling under
//! distributed job locks, bounded fan-out over domains, tournaments and
//! teams, run-scoped deduplication, priority-ordered stale selection and a
//! failed-job store with a backoff retry worker.

pub mod config;
pub mod crawl;
pub mod database;
pub mod dedup;
pub mod error;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod panic_hook;
pub mod priority;
pub mod retry;
pub mod scheduler;
pub mod services;

pub use error::{Error, Result};
