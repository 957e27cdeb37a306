//! Metric events.
//!
//! Counters and gauges recorded by the scheduler, the crawl pipeline and the
//! retry worker. Nothing is exported; consumers read a [`MetricsSnapshot`].

mod collector;

pub use collector::{JobMetrics, MetricsCollector, MetricsSnapshot};
