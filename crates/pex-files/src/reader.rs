//! Peer-aware remote reads.
//!
//! A reader is bound to one request: it carries the frozen request
//! context, the origin blob URL, and the chunk key being read. `pread`
//! walks the resolved peers first and falls back to the origin; `fstat`
//! always asks the origin. A request that itself came from a peer never
//! fans out to other peers, which caps any request tree at one hop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header;
use thiserror::Error;
use tracing::{debug, info, warn};

use pex_cache::CacheError;
use pex_core::context::{RangeError, CORRELATION_HEADER, NODE_HEADER, PEER_HEADER};
use pex_core::{ChunkKeyError, Metrics, RequestContext};
use pex_routing::{ContentRouter, NetError, PeerInfo, PeerNetwork};

use crate::parser::ParseError;

/// Errors from the files data plane.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Peer-mode request for content this node has not cached.
    #[error("not cached locally")]
    NotFound,

    /// A peer-mode file was asked for a chunk it did not commit to.
    #[error("file restricted to chunk {committed}, requested {requested}")]
    SingleChunkOnly { committed: u64, requested: u64 },

    /// The origin answered with an unexpected status.
    #[error("unexpected origin response status {status}")]
    Origin { status: u16 },

    /// A peer answered with a non-success status; the next peer is tried.
    #[error("unexpected peer response status {status}")]
    PeerStatus { status: u16 },

    /// A response carried fewer or more bytes than requested.
    #[error("remote returned {got} bytes, expected {expected}")]
    ShortRead { expected: u64, got: u64 },

    /// The origin response had neither a usable `Content-Length` nor a
    /// `Content-Range` total.
    #[error("origin response carried no usable length")]
    MissingLength,

    #[error("transport")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Network(#[from] NetError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("blob url: {0}")]
    Digest(#[source] ParseError),

    #[error(transparent)]
    Key(#[from] ChunkKeyError),
}

/// Remote byte access for one artifact.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Reads exactly `count` bytes at `offset`.
    async fn pread(&self, offset: u64, count: u64) -> Result<Bytes, ReadError>;

    /// The artifact's total length.
    async fn fstat(&self) -> Result<u64, ReadError>;
}

/// Tunables for [`RemoteReader`].
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Budget for peer resolution before the origin fall-through.
    pub resolve_timeout: Duration,
    /// Peers requested per resolution.
    pub resolve_retries: usize,
    /// This node's name, sent on outbound peer requests.
    pub node_name: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_millis(500),
            resolve_retries: 3,
            node_name: "pex".to_owned(),
        }
    }
}

/// [`Reader`] over peers and the origin.
pub struct RemoteReader {
    context: RequestContext,
    blob_url: String,
    chunk_key: String,
    router: Arc<dyn ContentRouter>,
    network: Arc<PeerNetwork>,
    metrics: Arc<dyn Metrics>,
    config: ReaderConfig,
}

impl RemoteReader {
    pub fn new(
        context: RequestContext,
        blob_url: String,
        chunk_key: String,
        router: Arc<dyn ContentRouter>,
        network: Arc<PeerNetwork>,
        metrics: Arc<dyn Metrics>,
        config: ReaderConfig,
    ) -> Self {
        Self {
            context,
            blob_url,
            chunk_key,
            router,
            network,
            metrics,
            config,
        }
    }

    /// Walks the resolved peers; `None` means fall through to origin.
    async fn read_from_peers(&self, offset: u64, count: u64) -> Option<Bytes> {
        if self.context.from_peer {
            warn!("refusing to propagate request from one peer to another");
            return None;
        }

        debug!(key = %self.chunk_key, "peer resolution start");
        let (mut peers, not_found) = match self
            .router
            .resolve_with_cache(&self.chunk_key, false, self.config.resolve_retries)
            .await
        {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!(%err, key = %self.chunk_key, "peer resolution failed");
                return None;
            }
        };

        let deadline = tokio::time::Instant::now() + self.config.resolve_timeout;
        let started = Instant::now();
        let mut discovered = false;
        loop {
            let peer = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    not_found.mark();
                    info!(key = %self.chunk_key, "peer not found");
                    return None;
                }
                peer = peers.recv() => match peer {
                    Some(peer) => peer,
                    None => {
                        not_found.mark();
                        info!(key = %self.chunk_key, "peer resolution exhausted");
                        return None;
                    }
                }
            };

            if !discovered {
                // Only the first peer's discovery latency is meaningful.
                self.metrics
                    .record_peer_discovery(&host_of(&peer.endpoint), started.elapsed().as_secs_f64());
                discovered = true;
            }

            let attempt = Instant::now();
            match self.fetch_from_peer(&peer, offset, count).await {
                Ok(bytes) => {
                    self.metrics.record_peer_response(
                        &host_of(&peer.endpoint),
                        "pread",
                        attempt.elapsed().as_secs_f64(),
                        count,
                    );
                    return Some(bytes);
                }
                Err(err) => {
                    warn!(%err, peer = %peer.endpoint, "peer request error");
                }
            }
        }
    }

    async fn fetch_from_peer(
        &self,
        peer: &PeerInfo,
        offset: u64,
        count: u64,
    ) -> Result<Bytes, ReadError> {
        let client = self.network.client_for(&peer.id)?;
        let url = format!("{}/blobs/{}", peer.endpoint, self.blob_url);
        debug!(%url, offset, count, "peer pread start");

        let response = client
            .get(url)
            .header(header::RANGE, range_value(offset, count))
            .header(PEER_HEADER, "true")
            .header(CORRELATION_HEADER, &self.context.correlation_id)
            .header(NODE_HEADER, &self.config.node_name)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            return Err(ReadError::PeerStatus { status });
        }
        let body = response.bytes().await?;
        if body.len() as u64 != count {
            return Err(ReadError::ShortRead {
                expected: count,
                got: body.len() as u64,
            });
        }
        Ok(body)
    }

    async fn read_from_origin(&self, offset: u64, count: u64) -> Result<Bytes, ReadError> {
        let started = Instant::now();
        let result = self.origin_get(offset, count).await;
        self.metrics.record_upstream_response(
            &host_of(&self.blob_url),
            "pread",
            started.elapsed().as_secs_f64(),
            result.as_ref().map(|b| b.len() as u64).unwrap_or(0),
        );
        result
    }

    async fn origin_get(&self, offset: u64, count: u64) -> Result<Bytes, ReadError> {
        debug!(url = %self.blob_url, offset, count, "origin pread start");
        let response = self
            .network
            .default_client()
            .get(&self.blob_url)
            .header(header::RANGE, range_value(offset, count))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 && status != 206 {
            return Err(ReadError::Origin { status });
        }
        let body = response.bytes().await?;
        if body.len() as u64 != count {
            return Err(ReadError::ShortRead {
                expected: count,
                got: body.len() as u64,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Reader for RemoteReader {
    async fn pread(&self, offset: u64, count: u64) -> Result<Bytes, ReadError> {
        if let Some(bytes) = self.read_from_peers(offset, count).await {
            return Ok(bytes);
        }
        self.read_from_origin(offset, count).await
    }

    /// Always asks the origin; peers are never consulted for sizes.
    async fn fstat(&self) -> Result<u64, ReadError> {
        let started = Instant::now();
        let result = self.origin_fstat().await;
        self.metrics.record_upstream_response(
            &host_of(&self.blob_url),
            "fstat",
            started.elapsed().as_secs_f64(),
            *result.as_ref().unwrap_or(&0),
        );
        result
    }
}

impl RemoteReader {
    async fn origin_fstat(&self) -> Result<u64, ReadError> {
        let response = self
            .network
            .default_client()
            .get(&self.blob_url)
            .header(header::RANGE, "bytes=0-0")
            .send()
            .await?;

        match response.status().as_u16() {
            // The origin ignored the range; Content-Length is the size.
            200 => response.content_length().ok_or(ReadError::MissingLength),
            // `Content-Range: bytes 0-0/<total>` carries the size.
            206 => {
                let total = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.rsplit_once('/'))
                    .and_then(|(_, total)| total.parse::<u64>().ok());
                match total {
                    Some(total) => Ok(total),
                    None => response.content_length().ok_or(ReadError::MissingLength),
                }
            }
            status => Err(ReadError::Origin { status }),
        }
    }
}

fn range_value(offset: u64, count: u64) -> String {
    format!("bytes={}-{}", offset, offset + count.max(1) - 1)
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
}
