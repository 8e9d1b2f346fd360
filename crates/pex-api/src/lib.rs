//! # pex-api — the HTTP surface
//!
//! One router serves both listeners (plain HTTP for local clients,
//! HTTPS with the peer identity certificate for the cluster):
//!
//! ```text
//! GET|HEAD  /blobs/*url   opaque blobs, chunked through the cache
//! GET|HEAD  /v2           distribution version probe
//! GET|HEAD  /v2/*ref      mirror (client request) or registry (peer request)
//! GET       /metrics      Prometheus exposition
//! ```
//!
//! ## Middleware (outermost first)
//!
//! panic recovery → request context → request log + metrics → handler.
//! The context middleware mints or propagates the correlation ID and the
//! from-peer flag; the per-request mode split (mirror vs registry) hangs
//! off that flag.

pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::AppError;
pub use metrics::PromMetrics;
pub use routes::app;
pub use state::{ApiConfig, AppState};
