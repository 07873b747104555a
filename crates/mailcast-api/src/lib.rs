//! Mailcast API - HTTP surface
//!
//! Campaign launch and status endpoints, the mail provider webhook receiver,
//! click tracking redirects, health probes and Prometheus metrics.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
