//! A chunked view of one remote artifact.
//!
//! Reads go through the chunk cache: the requested offset is aligned
//! down, the whole containing chunk is materialized (via the remote
//! reader on a miss), and the in-chunk slice is returned. A peer-mode
//! file is pinned to the single chunk the peer asked for; reads against
//! any other aligned offset fail rather than fan out.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, OnceCell};
use tracing::debug;

use pex_cache::ChunkCache;
use pex_core::ChunkKey;
use pex_core::segment::align_down;

use crate::reader::{ReadError, Reader};

/// One open artifact, readable at arbitrary offsets.
pub struct CachedFile {
    name: String,
    chunk_size: u64,
    /// Set for peer-mode files: the only aligned offset this file will
    /// serve.
    committed_chunk: Option<u64>,
    cache: Arc<ChunkCache>,
    reader: Arc<dyn Reader>,
    /// Successful miss-fills publish their chunk key here for the
    /// advertiser.
    filled_tx: mpsc::Sender<String>,
    size: OnceCell<u64>,
}

impl std::fmt::Debug for CachedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedFile")
            .field("name", &self.name)
            .field("chunk_size", &self.chunk_size)
            .field("committed_chunk", &self.committed_chunk)
            .field("size", &self.size.get())
            .finish_non_exhaustive()
    }
}

impl CachedFile {
    pub(crate) fn new(
        name: String,
        cache: Arc<ChunkCache>,
        reader: Arc<dyn Reader>,
        committed_chunk: Option<u64>,
        filled_tx: mpsc::Sender<String>,
    ) -> Self {
        let chunk_size = cache.chunk_size();
        Self {
            name,
            chunk_size,
            committed_chunk,
            cache,
            reader,
            filled_tx,
            size: OnceCell::new(),
        }
    }

    /// The artifact's total length, learned once from the metadata
    /// cache or the origin.
    pub async fn fstat(&self) -> Result<u64, ReadError> {
        self.size
            .get_or_try_init(|| async {
                if let Some(size) = self.cache.size(&self.name) {
                    return Ok(size);
                }
                debug!(name = %self.name, "artifact length cache miss");
                let size = self.reader.fstat().await?;
                self.cache.put_size(&self.name, size);
                Ok(size)
            })
            .await
            .copied()
    }

    /// The aligned offset a peer-mode file is restricted to.
    pub fn committed_chunk(&self) -> Option<u64> {
        self.committed_chunk
    }

    /// Reads up to `len` bytes at `offset`. Returns fewer bytes only at
    /// end of file; an empty buffer means `offset` is at or past it.
    pub async fn read_at(&self, len: usize, offset: u64) -> Result<Bytes, ReadError> {
        let size = self.fstat().await?;
        let aligned = align_down(offset, self.chunk_size);

        if let Some(committed) = self.committed_chunk {
            if aligned != committed {
                return Err(ReadError::SingleChunkOnly {
                    committed,
                    requested: aligned,
                });
            }
        }

        if offset >= size {
            return Ok(Bytes::new());
        }
        let count = self.chunk_size.min(size - aligned);

        let existed = self.cache.exists(&self.name, aligned);
        let reader = Arc::clone(&self.reader);
        let data = self
            .cache
            .get_or_create(&self.name, aligned, count, move || async move {
                reader.pread(aligned, count).await
            })
            .await?;

        if !existed {
            if let Ok(key) = ChunkKey::new(&self.name, aligned) {
                // Best effort: the advertiser re-publishes on refresh.
                let _ = self.filled_tx.try_send(key.to_string());
            }
        }

        let pos = (offset - aligned) as usize;
        if pos >= data.len() {
            return Ok(Bytes::new());
        }
        let end = data.len().min(pos + len);
        Ok(data.slice(pos..end))
    }
}
