//! kyu: job orchestration gateway for audio-analysis microservices.
//!
//! The gateway validates analysis requests against the shared volume,
//! submits them as job chains to database-backed queues and streams the
//! chains' progress back to the caller. Workers, in-process or as
//! `kyu-worker` processes, dispatch each job to its analysis service.

pub mod analysis;
pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod signal;

pub use error::{Error, Result};
