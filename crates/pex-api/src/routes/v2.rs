//! The `/v2` front door.
//!
//! Parses the distribution path and dispatches per request: peer-origin
//! requests are served by the registry (local store only), everything
//! else runs the mirror (reverse proxy to the first peer that answers).

use std::collections::HashMap;

use axum::extract::{OriginalUri, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use axum::Extension;
use tracing::debug;

use pex_core::RequestContext;
use pex_oci::distribution::parse_path_components;

use crate::error::AppError;
use crate::routes::{mirror, registry};
use crate::state::AppState;

/// `GET|HEAD /v2` — distribution version probe.
pub async fn probe() -> StatusCode {
    StatusCode::OK
}

/// `GET|HEAD /v2/<name>/{manifests,blobs}/<ref>`.
pub async fn handle(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let namespace = params
        .get("ns")
        .cloned()
        .unwrap_or_else(|| "docker.io".to_owned());

    let parsed = parse_path_components(&namespace, uri.path())
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    debug!(
        ns = %namespace,
        reference = parsed.reference.as_deref().unwrap_or(""),
        digest = parsed.digest.as_ref().map(|d| d.as_str()).unwrap_or(""),
        p2p = context.from_peer,
        "v2 handler start"
    );

    if context.from_peer {
        registry::handle(&state, &method, &parsed).await
    } else {
        mirror::handle(&state, &context, &method, &uri, &parsed).await
    }
}
