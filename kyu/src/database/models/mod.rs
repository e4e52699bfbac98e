//! Database models for kyu.
//!
//! These models map directly to the database schema. JSON columns stay as
//! strings here and are decoded by the pipeline layer.

pub mod job;
pub mod notification;

pub use job::*;
pub use notification::*;
