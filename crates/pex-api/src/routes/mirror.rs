//! Mirror mode: reverse proxy to the first peer that answers.
//!
//! The requested path and query are forwarded unchanged to each
//! resolved peer over its authenticated transport, with the from-peer
//! marker set so the peer serves only from its local store. Non-200
//! answers and transport errors move on to the next peer. A resolution
//! timeout is a 404; running out of peers within the budget is a 500.

use axum::body::Body;
use axum::http::{HeaderName, Method, Uri};
use axum::response::Response;
use tracing::{debug, info, warn};

use pex_core::context::{CORRELATION_HEADER, NODE_HEADER, PEER_HEADER};
use pex_core::RequestContext;
use pex_oci::distribution::PathComponents;
use pex_routing::PeerInfo;

use crate::error::AppError;
use crate::state::AppState;

pub async fn handle(
    state: &AppState,
    context: &RequestContext,
    method: &Method,
    uri: &Uri,
    parsed: &PathComponents,
) -> Result<Response, AppError> {
    let key = parsed
        .digest
        .as_ref()
        .map(|d| d.to_string())
        .or_else(|| parsed.reference.clone())
        .ok_or_else(|| AppError::Internal("neither digest nor reference provided".to_owned()))?;

    let mut peers = state
        .router
        .resolve(&key, false, state.config.mirror_resolve_retries)
        .await
        .map_err(|e| AppError::Internal(format!("resolve: {e}")))?;

    let deadline = tokio::time::Instant::now() + state.config.mirror_resolve_timeout;
    loop {
        let peer = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                info!(key = %key, "peer not found");
                return Err(AppError::NotFound);
            }
            peer = peers.recv() => match peer {
                Some(peer) => peer,
                None => {
                    info!(key = %key, "peer resolution exhausted");
                    return Err(AppError::Exhausted);
                }
            }
        };

        match forward(state, context, method, uri, &peer).await {
            Ok(Some(response)) => {
                info!(peer = %peer.endpoint, key = %key, "request served from peer");
                return Ok(response);
            }
            Ok(None) => {
                debug!(peer = %peer.endpoint, "peer returned non-200, attempting next");
            }
            Err(err) => {
                warn!(%err, peer = %peer.endpoint, "peer request failed, attempting next");
            }
        }
    }
}

/// Forwards the request to one peer. `Ok(None)` means the peer answered
/// with something other than 200 and the next peer should be tried.
async fn forward(
    state: &AppState,
    context: &RequestContext,
    method: &Method,
    uri: &Uri,
    peer: &PeerInfo,
) -> Result<Option<Response>, Box<dyn std::error::Error + Send + Sync>> {
    let client = state.network.client_for(&peer.id)?;
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = format!("{}{}", peer.endpoint, path_and_query);

    let upstream = client
        .request(method.clone(), url)
        .header(PEER_HEADER, "true")
        .header(CORRELATION_HEADER, &context.correlation_id)
        .header(NODE_HEADER, &state.config.node_name)
        .send()
        .await?;

    if upstream.status().as_u16() != 200 {
        return Ok(None);
    }

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    let response = builder.body(Body::from_stream(upstream.bytes_stream()))?;
    Ok(Some(response))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
