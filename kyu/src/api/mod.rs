//! HTTP API of the gateway.
//!
//! Analysis requests are answered with a Server-Sent Events stream of the
//! submitted chain's progress; the other routes inspect jobs and queues.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState, build_router};
