//! # pex-core — shared primitives
//!
//! Leaf crate for everything the data plane agrees on:
//!
//! - [`chunk`] — chunk keys, the routing and cache key for one aligned
//!   slice of an artifact.
//! - [`segment`] — segmentation of a byte range into aligned chunks.
//! - [`context`] — per-request context, wire header names, Range parsing.
//! - [`metrics`] — the metric sink trait the data plane records into.
//!
//! Nothing here performs I/O; the crate is consumed by every other
//! workspace member.

pub mod chunk;
pub mod context;
pub mod metrics;
pub mod segment;

pub use chunk::{ChunkKey, ChunkKeyError, CHUNK_KEY_SEP, DEFAULT_CHUNK_SIZE};
pub use context::RequestContext;
pub use metrics::{Metrics, NoopMetrics};
pub use segment::{align_down, segments, Segment, SegmentError, Segments};
