//! Request middleware: context enrichment and the request log.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, warn};

use pex_core::context::{CORRELATION_HEADER, NODE_HEADER, PEER_HEADER};
use pex_core::RequestContext;

use crate::state::AppState;

/// Builds the [`RequestContext`] from the inbound headers and attaches
/// it to the request. Runs outside everything but panic recovery.
pub async fn with_context(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let context = RequestContext::from_headers(
        headers.get(CORRELATION_HEADER).and_then(|v| v.to_str().ok()),
        headers.get(PEER_HEADER).and_then(|v| v.to_str().ok()),
        headers.get(NODE_HEADER).and_then(|v| v.to_str().ok()),
    );
    request.extensions_mut().insert(context);
    next.run(request).await
}

/// Emits one log line per request and feeds the request histogram. The
/// log level follows the status class: 5xx error, 4xx warn, else info.
pub async fn observe(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let context = request.extensions().get::<RequestContext>().cloned();

    let started = Instant::now();
    let response = next.run(request).await;
    let seconds = started.elapsed().as_secs_f64();

    let handler = if path.starts_with("/v2") {
        "oci"
    } else if path.starts_with("/blobs") {
        "files"
    } else {
        "other"
    };
    state.metrics.record_request(method.as_str(), handler, seconds);

    let status = response.status().as_u16();
    let correlation_id = context
        .as_ref()
        .map(|c| c.correlation_id.as_str())
        .unwrap_or("");
    let from_peer = context.as_ref().map(|c| c.from_peer).unwrap_or(false);

    if status >= 500 {
        error!(
            correlation_id,
            method = %method,
            path = %path,
            status,
            p2p = from_peer,
            duration_s = seconds,
            "request served"
        );
    } else if status >= 400 {
        warn!(
            correlation_id,
            method = %method,
            path = %path,
            status,
            p2p = from_peer,
            duration_s = seconds,
            "request served"
        );
    } else {
        info!(
            correlation_id,
            method = %method,
            path = %path,
            status,
            p2p = from_peer,
            duration_s = seconds,
            "request served"
        );
    }

    response
}
