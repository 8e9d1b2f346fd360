//! The files store: front door for opaque-blob requests.
//!
//! Derives the (chunk key, digest) pair from a request, opens chunked
//! files over the cache, and runs the prefetch pool. Successful fills
//! surface on the `subscribe` stream, which the advertiser drains.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use pex_cache::ChunkCache;
use pex_core::context::range_start;
use pex_core::segment::segments;
use pex_core::{ChunkKey, Metrics, RequestContext};
use pex_oci::Digest;
use pex_routing::{ContentRouter, PeerNetwork};

use crate::file::CachedFile;
use crate::parser::UrlDigestParser;
use crate::reader::{ReadError, Reader, ReaderConfig, RemoteReader};

/// Size of the queue between file opens and the advertiser.
const FILLED_CHANNEL_CAPACITY: usize = 1000;

/// Construction parameters for [`FilesStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefetch pool size; 0 disables prefetching.
    pub prefetch_workers: usize,
    /// Peer resolution budget per chunk read.
    pub resolve_timeout: Duration,
    /// Peers requested per resolution.
    pub resolve_retries: usize,
    /// This node's name, sent on outbound peer requests.
    pub node_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefetch_workers: 50,
            resolve_timeout: Duration::from_millis(500),
            resolve_retries: 3,
            node_name: "pex".to_owned(),
        }
    }
}

struct PrefetchJob {
    name: String,
    offset: u64,
    count: u64,
    reader: Arc<dyn Reader>,
}

/// Request-driven store for opaque blobs.
pub struct FilesStore {
    cache: Arc<ChunkCache>,
    router: Arc<dyn ContentRouter>,
    network: Arc<PeerNetwork>,
    metrics: Arc<dyn Metrics>,
    parser: Arc<dyn UrlDigestParser>,
    config: StoreConfig,
    prefetch_tx: Option<mpsc::Sender<PrefetchJob>>,
    filled_tx: mpsc::Sender<String>,
    filled_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl FilesStore {
    pub fn new(
        cache: Arc<ChunkCache>,
        router: Arc<dyn ContentRouter>,
        network: Arc<PeerNetwork>,
        metrics: Arc<dyn Metrics>,
        parser: Arc<dyn UrlDigestParser>,
        config: StoreConfig,
    ) -> Arc<Self> {
        let (filled_tx, filled_rx) = mpsc::channel(FILLED_CHANNEL_CAPACITY);

        let prefetch_tx = if config.prefetch_workers > 0 {
            let (tx, rx) = mpsc::channel::<PrefetchJob>(config.prefetch_workers);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..config.prefetch_workers {
                tokio::spawn(prefetch_worker(
                    Arc::clone(&rx),
                    Arc::clone(&cache),
                    filled_tx.clone(),
                ));
            }
            Some(tx)
        } else {
            None
        };

        Arc::new(Self {
            cache,
            router,
            network,
            metrics,
            parser,
            config,
            prefetch_tx,
            filled_tx,
            filled_rx: Mutex::new(Some(filled_rx)),
        })
    }

    /// The chunk cache backing this store.
    pub fn cache(&self) -> &Arc<ChunkCache> {
        &self.cache
    }

    /// The stream of freshly cached chunk keys. Single consumer; meant
    /// for the advertiser.
    pub fn subscribe(&self) -> Option<mpsc::Receiver<String>> {
        self.filled_rx.lock().take()
    }

    /// Derives the cache key and digest for a request.
    ///
    /// GET requests honor the `Range` start (default 0 when absent);
    /// HEAD requests always address chunk 0. Fails when the URL carries
    /// no recognizable digest or the `Range` header is malformed.
    pub fn key(
        &self,
        is_get: bool,
        range_header: Option<&str>,
        blob_url: &str,
    ) -> Result<(ChunkKey, Digest), ReadError> {
        let digest = self
            .parser
            .parse_digest(blob_url)
            .map_err(ReadError::Digest)?;

        let start = match range_header {
            Some(value) if is_get => range_start(value)?,
            _ => 0,
        };

        let key = ChunkKey::containing(digest.as_str(), start, self.cache.chunk_size())?;
        info!(digest = %digest, key = %key, "store key");
        Ok((key, digest))
    }

    /// Opens the artifact behind `key` for reading.
    ///
    /// Peer-originated requests are served only from cache: a miss is
    /// `NotFound`, and the returned file stays pinned to the requested
    /// chunk. Client requests get an unrestricted file, and the whole
    /// artifact is queued for prefetch.
    pub async fn open(
        &self,
        context: &RequestContext,
        key: &ChunkKey,
        blob_url: String,
    ) -> Result<CachedFile, ReadError> {
        let name = key.name().to_owned();
        let aligned = key.offset();

        if context.from_peer && !self.cache.exists(&name, aligned) {
            info!(name = %name, offset = aligned, "peer request not cached");
            return Err(ReadError::NotFound);
        }

        let reader: Arc<dyn Reader> = Arc::new(RemoteReader::new(
            context.clone(),
            blob_url,
            key.to_string(),
            Arc::clone(&self.router),
            Arc::clone(&self.network),
            Arc::clone(&self.metrics),
            ReaderConfig {
                resolve_timeout: self.config.resolve_timeout,
                resolve_retries: self.config.resolve_retries,
                node_name: self.config.node_name.clone(),
            },
        ));

        let committed = context.from_peer.then_some(aligned);
        let file = CachedFile::new(
            name.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&reader),
            committed,
            self.filled_tx.clone(),
        );

        let size = file.fstat().await?;
        self.enqueue_prefetch(name, size, reader);

        Ok(file)
    }

    /// Queues every chunk of the artifact for the prefetch pool. The
    /// queue is bounded; when it is full this blocks the producer task,
    /// which is the backpressure mechanism.
    fn enqueue_prefetch(&self, name: String, size: u64, reader: Arc<dyn Reader>) {
        let Some(tx) = self.prefetch_tx.clone() else {
            return;
        };
        let chunk_size = self.cache.chunk_size();
        tokio::spawn(async move {
            let segs = match segments(0, chunk_size, size, size) {
                Ok(segs) => segs,
                Err(err) => {
                    error!(%err, "prefetch segmentation failed");
                    return;
                }
            };
            for seg in segs {
                let job = PrefetchJob {
                    name: name.clone(),
                    offset: seg.index,
                    count: seg.count,
                    reader: Arc::clone(&reader),
                };
                if tx.send(job).await.is_err() {
                    return;
                }
            }
        });
    }
}

/// Drains the prefetch queue: materializes each segment through the
/// cache and publishes the chunk key on success.
async fn prefetch_worker(
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<PrefetchJob>>>,
    cache: Arc<ChunkCache>,
    filled_tx: mpsc::Sender<String>,
) {
    loop {
        let job = {
            let mut rx = jobs.lock().await;
            match rx.recv().await {
                Some(job) => job,
                None => return,
            }
        };

        let reader = Arc::clone(&job.reader);
        let offset = job.offset;
        let count = job.count;
        match cache
            .get_or_create(&job.name, offset, count, move || async move {
                reader.pread(offset, count).await
            })
            .await
        {
            Ok(_) => {
                if let Ok(key) = ChunkKey::new(&job.name, job.offset) {
                    let _ = filled_tx.send(key.to_string()).await;
                }
            }
            Err(err) => {
                debug!(%err, name = %job.name, offset = job.offset, "prefetch failed");
            }
        }
    }
}
