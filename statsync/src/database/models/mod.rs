//! Database row models.
//!
//! These map directly to the schema in `migrations/`. Timestamps are epoch
//! milliseconds; conversion to `chrono` happens at the domain boundary.

pub mod entity;
pub mod failed_job;
pub mod lock;

pub use entity::*;
pub use failed_job::*;
pub use lock::*;
