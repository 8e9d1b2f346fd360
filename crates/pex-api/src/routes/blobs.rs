//! The opaque-blob handler.
//!
//! `GET|HEAD /blobs/<origin-url>`: the wildcard is the blob's origin
//! URL, query string included. Bytes are served chunk by chunk through
//! the cache; ranged requests answer 206 with a `Content-Range`, full
//! reads answer 200. The correlation and node headers are echoed back.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::Extension;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use pex_core::context::{range_span, CORRELATION_HEADER, NODE_HEADER};
use pex_core::segment::segments;
use pex_core::RequestContext;

use crate::error::AppError;
use crate::state::AppState;

pub async fn handle(
    State(state): State<AppState>,
    Extension(context): Extension<RequestContext>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let raw_path = uri
        .path()
        .strip_prefix("/blobs/")
        .unwrap_or("")
        .trim_start_matches('/');
    let blob_url = match uri.query() {
        Some(query) => format!("{raw_path}?{query}"),
        None => raw_path.to_owned(),
    };
    debug!(blob = %blob_url, p2p = context.from_peer, "files handler start");

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let (key, _digest) = state
        .files
        .key(method == Method::GET, range_header.as_deref(), &blob_url)?;
    let file = state.files.open(&context, &key, blob_url).await?;
    let size = file.fstat().await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&context.correlation_id) {
        response_headers.insert(CORRELATION_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&state.config.node_name) {
        response_headers.insert(NODE_HEADER, value);
    }

    let (status, start, end) = match range_header.as_deref() {
        Some(value) => {
            let (start, end) =
                range_span(value, size).map_err(|e| AppError::BadRequest(e.to_string()))?;
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        None => {
            if size == 0 {
                return Ok(empty_response(StatusCode::OK, response_headers));
            }
            (StatusCode::OK, 0, size - 1)
        }
    };

    let length = end - start + 1;
    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if status == StatusCode::PARTIAL_CONTENT {
        let value = format!("bytes {start}-{end}/{size}");
        if let Ok(value) = HeaderValue::from_str(&value) {
            response_headers.insert(header::CONTENT_RANGE, value);
        }
    }

    if method == Method::HEAD {
        return Ok(empty_response(status, response_headers));
    }

    let chunk_size = state.files.cache().chunk_size();
    let mut segs =
        segments(start, chunk_size, length, size).map_err(|e| AppError::Internal(e.to_string()))?;

    // The first segment is read eagerly so origin failures still map to
    // a status code instead of a broken body.
    let first = match segs.next() {
        Some(seg) => file.read_at(seg.count as usize, seg.index + seg.offset).await?,
        None => Bytes::new(),
    };

    let file = Arc::new(file);
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        if tx.send(Ok(first)).await.is_err() {
            return;
        }
        for seg in segs {
            match file.read_at(seg.count as usize, seg.index + seg.offset).await {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                    return;
                }
            }
        }
    });

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| AppError::Internal(e.to_string()))?;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn empty_response(status: StatusCode, headers: HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
