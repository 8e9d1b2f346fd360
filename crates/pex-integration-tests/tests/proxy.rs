//! End-to-end data plane scenarios.

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use pex_core::context::PEER_HEADER;
use support::{harness, spawn_origin, spawn_peer, spawn_peer_with};

const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn blob_path(origin: &std::net::SocketAddr) -> String {
    format!("/blobs/http://{origin}/data?d={DIGEST}")
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

/// Scenario: no peers provide the chunk, so the read falls through to
/// the origin, succeeds, and the chunk lands in the cache.
#[tokio::test]
async fn peer_cache_miss_falls_through_to_origin() {
    let origin = spawn_origin(b"expected-result").await;
    let mut h = harness();

    let request = Request::builder()
        .uri(blob_path(&origin.addr))
        .header("Range", "bytes=0-9")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body_bytes(response).await[..], b"expected-r");

    assert!(h.cache.exists(DIGEST, 0), "chunk must be cached after the fill");
    assert!(origin.data_hits.load(Ordering::SeqCst) >= 1);

    // The fill is observable on the advertisement stream.
    let filled = tokio::time::timeout(Duration::from_secs(2), h.filled.recv())
        .await
        .expect("fill notification timed out")
        .unwrap();
    assert_eq!(filled, format!("{DIGEST}_0"));
}

/// Scenario: three peers are registered; the first answers 502, the
/// second 404, the third serves the bytes. The read succeeds without
/// touching the origin's data path.
#[tokio::test]
async fn peer_retry_walks_past_failures() {
    let origin = spawn_origin(b"expected-result").await;
    let bad = spawn_peer(StatusCode::BAD_GATEWAY, b"").await;
    let missing = spawn_peer(StatusCode::NOT_FOUND, b"").await;
    let good = spawn_peer(StatusCode::OK, b"expected-result").await;

    let h = harness();
    // The artifact length is already known, so no stat reaches origin.
    h.cache.put_size(DIGEST, 15);
    h.router.set_peers(
        &format!("{DIGEST}_0"),
        vec![bad.info.clone(), missing.info.clone(), good.info.clone()],
    );

    let request = Request::builder()
        .uri(blob_path(&origin.addr))
        .header("Range", "bytes=0-9")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body_bytes(response).await[..], b"expected-r");

    assert_eq!(bad.hits.load(Ordering::SeqCst), 1);
    assert_eq!(missing.hits.load(Ordering::SeqCst), 1);
    assert_eq!(good.hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        origin.hits.load(Ordering::SeqCst),
        0,
        "peers satisfied the read; origin must stay untouched"
    );
}

/// Scenario: a peer-originated request whose chunk is not cached is
/// refused outright, with no outbound traffic of any kind.
#[tokio::test]
async fn loop_prevention_refuses_uncached_peer_requests() {
    let origin = spawn_origin(b"expected-result").await;
    let h = harness();

    let request = Request::builder()
        .uri(blob_path(&origin.addr))
        .header("Range", "bytes=1048576-1048748")
        .header(PEER_HEADER, "true")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 0);
    assert!(h.router.resolved_keys().is_empty());
}

/// A peer-originated request for a chunk we do hold is served from the
/// cache, again without any outbound traffic.
#[tokio::test]
async fn cached_chunks_are_served_to_peers_locally() {
    let origin = spawn_origin(b"expected-result").await;
    let h = harness();

    // Prime chunk 0 with a client read.
    let request = Request::builder()
        .uri(blob_path(&origin.addr))
        .header("Range", "bytes=0-9")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    body_bytes(response).await;
    let primed_hits = origin.hits.load(Ordering::SeqCst);

    let request = Request::builder()
        .uri(blob_path(&origin.addr))
        .header("Range", "bytes=2-5")
        .header(PEER_HEADER, "true")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(&body_bytes(response).await[..], b"pect");
    assert_eq!(
        origin.hits.load(Ordering::SeqCst),
        primed_hits,
        "a cached peer read must not reach origin"
    );
}

/// The v2 mirror relays the first 200 a peer returns, headers included.
#[tokio::test]
async fn mirror_relays_a_peer_manifest() {
    let mut headers = HeaderMap::new();
    headers.insert("Docker-Content-Digest", HeaderValue::from_static(DIGEST));
    headers.insert(
        "Content-Type",
        HeaderValue::from_static("application/vnd.oci.image.manifest.v1+json"),
    );
    let peer = spawn_peer_with(StatusCode::OK, b"test", headers).await;

    let h = harness();
    h.router.set_peers(DIGEST, vec![peer.info.clone()]);

    let request = Request::builder()
        .uri(format!("/v2/library/alpine/manifests/{DIGEST}"))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["Docker-Content-Digest"], DIGEST);
    assert_eq!(&body_bytes(response).await[..], b"test");
    assert_eq!(peer.hits.load(Ordering::SeqCst), 1);
}

/// Mirror peers that fail are walked past; a later peer can still
/// serve.
#[tokio::test]
async fn mirror_walks_past_failing_peers() {
    let bad = spawn_peer(StatusCode::INTERNAL_SERVER_ERROR, b"").await;
    let good = spawn_peer(StatusCode::OK, b"manifest-bytes").await;

    let h = harness();
    h.router
        .set_peers(DIGEST, vec![bad.info.clone(), good.info.clone()]);

    let request = Request::builder()
        .uri(format!("/v2/library/alpine/manifests/{DIGEST}"))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"manifest-bytes");
    assert_eq!(bad.hits.load(Ordering::SeqCst), 1);
    assert_eq!(good.hits.load(Ordering::SeqCst), 1);
}

/// A second read of the same chunk is served from the cache without a
/// second origin data fetch.
#[tokio::test]
async fn repeated_reads_hit_the_cache() {
    let origin = spawn_origin(b"expected-result").await;
    let h = harness();

    for _ in 0..2 {
        let request = Request::builder()
            .uri(blob_path(&origin.addr))
            .header("Range", "bytes=0-9")
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(&body_bytes(response).await[..], b"expected-r");
    }

    assert_eq!(
        origin.data_hits.load(Ordering::SeqCst),
        1,
        "the second read must come from the cache"
    );
}

/// HEAD requests answer with headers only and the full length.
#[tokio::test]
async fn head_reports_the_artifact_length() {
    let origin = spawn_origin(b"expected-result").await;
    let h = harness();

    let request = Request::builder()
        .method("HEAD")
        .uri(blob_path(&origin.addr))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["Content-Length"], "15");
    assert_eq!(
        response.headers()["Content-Type"],
        "application/octet-stream"
    );
    assert!(body_bytes(response).await.is_empty());
}
