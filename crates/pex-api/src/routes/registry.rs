//! Registry mode: serving peers from the local OCI store.
//!
//! Peers get exactly what this node already holds. Manifests over 4 MiB
//! are refused (a manifest that size is not a manifest), and failures
//! surface as plain statuses with no detail.

use axum::body::Body;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::Response;
use tracing::warn;

use pex_oci::distribution::{PathComponents, ReferenceType};
use pex_oci::Digest;

use crate::error::AppError;
use crate::state::AppState;

/// `Docker-Content-Digest` response header.
pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

pub async fn handle(
    state: &AppState,
    method: &Method,
    parsed: &PathComponents,
) -> Result<Response, AppError> {
    let digest = match &parsed.digest {
        Some(digest) => digest.clone(),
        None => {
            let reference = parsed
                .reference
                .as_deref()
                .ok_or_else(|| AppError::Internal("neither digest nor reference".to_owned()))?;
            state
                .oci
                .resolve(reference)
                .await
                .map_err(|_| AppError::NotFound)?
        }
    };

    match parsed.ref_type {
        ReferenceType::Manifest => manifest(state, method, &digest).await,
        ReferenceType::Blob => blob(state, method, &digest).await,
    }
}

async fn manifest(
    state: &AppState,
    method: &Method,
    digest: &Digest,
) -> Result<Response, AppError> {
    let size = state
        .oci
        .size(digest)
        .await
        .map_err(|_| AppError::NotFound)?;
    if size >= MAX_MANIFEST_SIZE {
        warn!(%digest, size, "refusing to serve an oversized manifest");
        return Err(AppError::NotFound);
    }

    let (data, media_type) = state
        .oci
        .bytes(digest)
        .await
        .map_err(|_| AppError::NotFound)?;

    let mut response = Response::new(if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(data.clone())
    });
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&media_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len() as u64));
    if let Ok(value) = HeaderValue::from_str(digest.as_str()) {
        headers.insert(DOCKER_CONTENT_DIGEST, value);
    }
    Ok(response)
}

async fn blob(state: &AppState, method: &Method, digest: &Digest) -> Result<Response, AppError> {
    let size = state
        .oci
        .size(digest)
        .await
        .map_err(|_| AppError::NotFound)?;

    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        let data = state
            .oci
            .blob(digest)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Body::from(data)
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(digest.as_str()) {
        headers.insert(DOCKER_CONTENT_DIGEST, value);
    }
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}
