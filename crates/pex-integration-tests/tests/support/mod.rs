//! Shared fixtures: a ranged origin server, TLS peer servers with real
//! libp2p identity certificates, and an app harness wired over the
//! scripted router.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use libp2p::identity::Keypair;
use libp2p::PeerId;

use pex_api::{ApiConfig, AppState};
use pex_cache::{CacheConfig, ChunkCache};
use pex_core::NoopMetrics;
use pex_files::{FilesStore, ParseError, StoreConfig, UrlDigestParser};
use pex_oci::{Digest, MemoryStore};
use pex_routing::mock::MockRouter;
use pex_routing::{PeerInfo, PeerNetwork};

/// Digest parser for test origins: reads the `d=` query parameter of
/// any URL, so origins can live on loopback.
pub struct QueryDigestParser;

impl UrlDigestParser for QueryDigestParser {
    fn parse_digest(&self, url: &str) -> Result<Digest, ParseError> {
        let (_, query) = url.split_once('?').ok_or(ParseError::Unrecognized)?;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("d="))
            .and_then(|digest| Digest::parse(digest).ok())
            .ok_or(ParseError::Unrecognized)
    }
}

#[derive(Clone)]
struct OriginState {
    payload: Bytes,
    hits: Arc<AtomicU32>,
    data_hits: Arc<AtomicU32>,
}

/// An origin serving one payload with byte-range support.
pub struct Origin {
    pub addr: SocketAddr,
    /// Every request, including `bytes=0-0` stats.
    pub hits: Arc<AtomicU32>,
    /// Requests for actual data ranges.
    pub data_hits: Arc<AtomicU32>,
}

pub async fn spawn_origin(payload: &'static [u8]) -> Origin {
    let state = OriginState {
        payload: Bytes::from_static(payload),
        hits: Arc::new(AtomicU32::new(0)),
        data_hits: Arc::new(AtomicU32::new(0)),
    };
    let hits = Arc::clone(&state.hits);
    let data_hits = Arc::clone(&state.data_hits);

    let app = Router::new()
        .route("/data", get(origin_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Origin {
        addr,
        hits,
        data_hits,
    }
}

async fn origin_handler(State(state): State<OriginState>, headers: HeaderMap) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let total = state.payload.len() as u64;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(start, end)| {
            let start: u64 = start.parse().ok()?;
            let end: u64 = if end.is_empty() {
                total.saturating_sub(1)
            } else {
                end.parse().ok()?
            };
            Some((start, end.min(total.saturating_sub(1))))
        });

    match range {
        Some((start, end)) if start < total => {
            if (start, end) != (0, 0) {
                state.data_hits.fetch_add(1, Ordering::SeqCst);
            }
            let slice = state.payload.slice(start as usize..=end as usize);
            (
                StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )],
                slice,
            )
                .into_response()
        }
        _ => (StatusCode::OK, state.payload.clone()).into_response(),
    }
}

/// A peer node's HTTPS endpoint: real TLS from a libp2p identity,
/// scripted response.
pub struct Peer {
    pub info: PeerInfo,
    pub hits: Arc<AtomicU32>,
}

pub async fn spawn_peer(status: StatusCode, body: &'static [u8]) -> Peer {
    spawn_peer_with(status, body, HeaderMap::new()).await
}

pub async fn spawn_peer_with(
    status: StatusCode,
    body: &'static [u8],
    extra_headers: HeaderMap,
) -> Peer {
    let keypair = Keypair::generate_ed25519();
    let peer_id = PeerId::from(keypair.public());
    let network = PeerNetwork::new(&keypair).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let handler_hits = Arc::clone(&hits);
    let app = Router::new().fallback(move |_request: Request<Body>| {
        let hits = Arc::clone(&handler_hits);
        let extra_headers = extra_headers.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            let mut response = (status, Bytes::from_static(body)).into_response();
            response.headers_mut().extend(extra_headers);
            response
        }
    });

    let tls = RustlsConfig::from_config(network.server_config());
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = axum_server::bind_rustls("127.0.0.1:0".parse().unwrap(), tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await;
        });
    }
    let addr = handle.listening().await.expect("peer listener");

    Peer {
        info: PeerInfo {
            id: peer_id,
            endpoint: format!("https://{addr}"),
        },
        hits,
    }
}

/// The proxy under test.
pub struct Harness {
    pub app: Router,
    pub router: Arc<MockRouter>,
    pub oci: Arc<MemoryStore>,
    pub cache: Arc<ChunkCache>,
    pub filled: tokio::sync::mpsc::Receiver<String>,
    _cache_dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ChunkCache::new(CacheConfig::new(cache_dir.path())).unwrap());
    let router = Arc::new(MockRouter::new());
    let network = Arc::new(PeerNetwork::new(&Keypair::generate_ed25519()).unwrap());
    let oci = Arc::new(MemoryStore::new());

    let files = FilesStore::new(
        Arc::clone(&cache),
        router.clone(),
        Arc::clone(&network),
        Arc::new(NoopMetrics),
        Arc::new(QueryDigestParser),
        StoreConfig {
            prefetch_workers: 0,
            // Generous: the scripted resolutions answer instantly, and
            // walking several TLS peers must fit in the budget.
            resolve_timeout: std::time::Duration::from_secs(2),
            ..StoreConfig::default()
        },
    );
    let filled = files.subscribe().unwrap();

    let state = AppState {
        files,
        oci: oci.clone(),
        router: router.clone(),
        network,
        metrics: Arc::new(NoopMetrics),
        prom: None,
        config: ApiConfig {
            mirror_resolve_timeout: std::time::Duration::from_secs(2),
            ..ApiConfig::default()
        },
    };

    Harness {
        app: pex_api::app(state),
        router,
        oci,
        cache,
        filled,
        _cache_dir: cache_dir,
    }
}
