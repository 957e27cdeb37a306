//! Repository layer for database access.
//!
//! Each repository is a trait with an `Sqlx*` implementation so callers can
//! be exercised against in-memory doubles.

pub mod entity;
pub mod failed_job;
pub mod lock;

pub use entity::*;
pub use failed_job::*;
pub use lock::*;
