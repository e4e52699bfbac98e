//! Repository layer for database access.
//!
//! Each repository is a trait with a `Sqlx*` implementation so the pipeline
//! layer can be exercised against a real SQLite file in tests.

pub mod job;
pub mod notification;

pub use job::*;
pub use notification::*;
