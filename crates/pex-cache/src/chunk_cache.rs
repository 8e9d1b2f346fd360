//! Disk-backed chunk cache.
//!
//! Each cached chunk owns one file at `<root>/<name>/<aligned-offset>`.
//! The in-memory index is a [`quick_cache`] cache whose weigher charges
//! every entry one full chunk of cost, so total disk usage is bounded by
//! `max_cost` regardless of tail-chunk sizes. Entries are inserted only
//! after their file has been fully written; a reserved-but-unfilled slot
//! exists only as a placeholder guard that concurrent callers wait on.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use quick_cache::{sync::Cache, Weighter};
use thiserror::Error;
use tracing::{debug, warn};

use pex_core::{ChunkKey, ChunkKeyError};

use crate::metadata::MetadataCache;

/// Default cache capacity: 4 GiB of chunk cost.
pub const DEFAULT_MAX_COST: u64 = 4 * 1024 * 1024 * 1024;

const DEFAULT_METADATA_CAPACITY: usize = 100_000;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The fill returned a byte count different from the requested one.
    /// No entry remains for the key.
    #[error("chunk fill returned {got} bytes, expected {expected}")]
    FetchMismatch { expected: u64, got: u64 },

    /// The backing store failed; the entry (if any) has been dropped.
    #[error("chunk cache i/o")]
    Io(#[from] std::io::Error),

    /// The fill itself failed. The source error is the fetcher's.
    #[error("chunk fill failed")]
    Fetch(#[source] BoxError),

    #[error(transparent)]
    Key(#[from] ChunkKeyError),
}

/// Construction parameters for [`ChunkCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory that receives the chunk files.
    pub root: PathBuf,
    /// Total cost bound, in bytes at chunk-size granularity.
    pub max_cost: u64,
    /// Chunk size; must be a power of two.
    pub chunk_size: u64,
    /// Entry bound of the artifact-length metadata cache.
    pub metadata_capacity: usize,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_cost: DEFAULT_MAX_COST,
            chunk_size: pex_core::DEFAULT_CHUNK_SIZE,
            metadata_capacity: DEFAULT_METADATA_CAPACITY,
        }
    }
}

/// One cached chunk. Owns its backing file: dropping the last handle
/// unlinks it, which keeps eviction safe against concurrent readers.
#[derive(Debug)]
struct ChunkEntry {
    path: PathBuf,
    len: u64,
}

impl Drop for ChunkEntry {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), len = self.len, "chunk drop");
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to remove chunk file");
        }
    }
}

/// Charges every entry one full chunk, so capacity is accounted the same
/// way for tail chunks as for full ones.
#[derive(Clone)]
struct ChunkCost(u64);

impl Weighter<ChunkKey, Arc<ChunkEntry>> for ChunkCost {
    fn weight(&self, _key: &ChunkKey, _entry: &Arc<ChunkEntry>) -> u64 {
        self.0
    }
}

/// Bounded, cost-metered chunk cache with single-flight population.
pub struct ChunkCache {
    root: PathBuf,
    chunk_size: u64,
    chunks: Cache<ChunkKey, Arc<ChunkEntry>, ChunkCost>,
    sizes: MetadataCache,
}

impl ChunkCache {
    /// Creates the cache, preparing the backing directory.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.root)?;
        let estimated_items = (config.max_cost / config.chunk_size).max(1) as usize;
        Ok(Self {
            root: config.root,
            chunk_size: config.chunk_size,
            chunks: Cache::with_weighter(
                estimated_items,
                config.max_cost,
                ChunkCost(config.chunk_size),
            ),
            sizes: MetadataCache::new(config.metadata_capacity),
        })
    }

    /// The configured chunk size.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// True iff the chunk is cached and its backing file is non-empty.
    pub fn exists(&self, name: &str, offset: u64) -> bool {
        let Ok(key) = ChunkKey::new(name, offset) else {
            return false;
        };
        match self.chunks.peek(&key) {
            Some(entry) => std::fs::metadata(&entry.path)
                .map(|m| m.len() > 0)
                .unwrap_or(false),
            None => false,
        }
    }

    /// The cached total length of an artifact, if known.
    pub fn size(&self, name: &str) -> Option<u64> {
        self.sizes.get(name)
    }

    /// Remembers the total length of an artifact.
    pub fn put_size(&self, name: &str, len: u64) {
        debug!(name, len, "put artifact length");
        self.sizes.put(name, len);
    }

    /// Returns the chunk's bytes, filling it via `fetch` on a miss.
    ///
    /// Single-flight: concurrent callers for one key run at most one
    /// `fetch`; the others await its outcome. `fetch` must produce exactly
    /// `count` bytes or the fill fails with [`CacheError::FetchMismatch`]
    /// and no entry remains.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        name: &str,
        aligned_offset: u64,
        count: u64,
        fetch: F,
    ) -> Result<Bytes, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let key = ChunkKey::new(name, aligned_offset)?;
        match self.chunks.get_value_or_guard_async(&key).await {
            Ok(entry) => {
                let data = tokio::fs::read(&entry.path).await?;
                if data.len() as u64 != count {
                    // A truncated file cannot satisfy anyone; drop it.
                    self.chunks.remove(&key);
                    return Err(CacheError::FetchMismatch {
                        expected: count,
                        got: data.len() as u64,
                    });
                }
                Ok(Bytes::from(data))
            }
            Err(guard) => {
                let data = fetch().await.map_err(|e| CacheError::Fetch(e.into()))?;
                if data.len() as u64 != count {
                    return Err(CacheError::FetchMismatch {
                        expected: count,
                        got: data.len() as u64,
                    });
                }

                let path = self.chunk_path(&key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if let Err(err) = tokio::fs::write(&path, &data).await {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(err.into());
                }

                let _ = guard.insert(Arc::new(ChunkEntry {
                    path,
                    len: data.len() as u64,
                }));
                Ok(data)
            }
        }
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.root.join(key.name()).join(key.offset().to_string())
    }

    /// The directory that holds the chunk files.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn small_cache(dir: &Path, max_chunks: u64, chunk_size: u64) -> ChunkCache {
        ChunkCache::new(CacheConfig {
            root: dir.to_path_buf(),
            max_cost: max_chunks * chunk_size,
            chunk_size,
            metadata_capacity: 16,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn miss_fills_and_subsequent_hit_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 16, 16);

        let fills = AtomicU32::new(0);
        let data = cache
            .get_or_create("name", 0, 5, || async {
                fills.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Bytes::from_static(b"hello"))
            })
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(cache.exists("name", 0));
        assert_eq!(
            std::fs::read(dir.path().join("name").join("0")).unwrap(),
            b"hello"
        );

        let again = cache
            .get_or_create("name", 0, 5, || async {
                fills.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(Bytes::new())
            })
            .await
            .unwrap();
        assert_eq!(&again[..], b"hello");
        assert_eq!(fills.load(Ordering::SeqCst), 1, "hit must not re-fetch");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fill() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(small_cache(dir.path(), 16, 16));
        let fills = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let fills = Arc::clone(&fills);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create("k", 0, 4, move || async move {
                        fills.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                        Ok::<_, std::io::Error>(Bytes::from_static(b"data"))
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(&task.await.unwrap().unwrap()[..], b"data");
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1, "single-flight violated");
    }

    #[tokio::test]
    async fn short_fill_fails_and_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 16, 16);

        let err = cache
            .get_or_create("name", 0, 10, || async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"short"))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::FetchMismatch { expected: 10, got: 5 }
        ));
        assert!(!cache.exists("name", 0));
        assert!(!dir.path().join("name").join("0").exists());
    }

    #[tokio::test]
    async fn fetch_error_propagates_and_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 16, 16);

        let err = cache
            .get_or_create("name", 16, 4, || async {
                Err::<Bytes, _>(std::io::Error::other("origin down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(_)));
        assert!(!cache.exists("name", 16));
    }

    #[tokio::test]
    async fn eviction_unlinks_backing_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 2, 4);

        for offset in [0u64, 4, 8, 12] {
            cache
                .get_or_create("name", offset, 4, || async {
                    Ok::<_, std::io::Error>(Bytes::from_static(b"xxxx"))
                })
                .await
                .unwrap();
        }

        let on_disk = std::fs::read_dir(dir.path().join("name")).unwrap().count();
        assert!(on_disk <= 2, "expected at most 2 chunk files, found {on_disk}");
    }

    #[tokio::test]
    async fn sizes_round_trip_through_the_metadata_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 2, 4);
        assert_eq!(cache.size("a"), None);
        cache.put_size("a", 123);
        assert_eq!(cache.size("a"), Some(123));
    }

    #[tokio::test]
    async fn rejects_names_carrying_the_separator() {
        let dir = tempfile::tempdir().unwrap();
        let cache = small_cache(dir.path(), 2, 4);
        let err = cache
            .get_or_create("a_b", 0, 1, || async {
                Ok::<_, std::io::Error>(Bytes::from_static(b"x"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Key(_)));
        assert!(!cache.exists("a_b", 0));
    }
}
