//! Route table assembly.

pub mod blobs;
pub mod mirror;
pub mod registry;
pub mod v2;

use axum::http::StatusCode;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;

use crate::middleware::{observe, with_context};
use crate::state::AppState;

/// Assembles the full router. Every data route serves GET and HEAD with
/// the same handler.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/blobs/*url", get(blobs::handle))
        .route("/v2", get(v2::probe))
        .route("/v2/*reference", get(v2::handle))
        .route("/metrics", get(metrics_text))
        .layer(axum::middleware::from_fn_with_state(state.clone(), observe))
        .layer(axum::middleware::from_fn(with_context))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Prometheus text exposition, when metrics are Prometheus-backed.
async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    match &state.prom {
        Some(prom) => (StatusCode::OK, prom.gather_text()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
