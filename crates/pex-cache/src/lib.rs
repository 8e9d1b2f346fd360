//! # pex-cache — the chunk cache
//!
//! A bounded mapping from chunk key to an on-disk chunk file, metered by
//! cost (bytes at chunk-size granularity), with single-flight population:
//! concurrent requests for a missing chunk run the fetch exactly once and
//! share its outcome. Eviction unlinks the backing file once the last
//! concurrent reader is done with it.
//!
//! A separate bounded [`MetadataCache`] remembers total artifact lengths,
//! which are cheap to re-fetch and therefore evicted casually.

mod chunk_cache;
mod metadata;

pub use chunk_cache::{CacheConfig, CacheError, ChunkCache, DEFAULT_MAX_COST};
pub use metadata::MetadataCache;
