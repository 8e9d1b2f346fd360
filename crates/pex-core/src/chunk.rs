//! Chunk keys.
//!
//! A chunk key names one aligned slice of an artifact and doubles as the
//! cache key and the content-routing key. Wire format:
//! `<name><SEP><aligned-offset-in-decimal>` where `name` is a digest
//! string (`sha256:...`) or an OCI reference. The separator is fixed and
//! must not occur in `name`; every constructor enforces this.

use std::fmt;

use thiserror::Error;

use crate::segment::align_down;

/// Separator between the artifact name and the aligned offset.
pub const CHUNK_KEY_SEP: char = '_';

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Errors from chunk key construction and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkKeyError {
    /// The artifact name contains the separator byte.
    #[error("artifact name {0:?} contains the chunk key separator {CHUNK_KEY_SEP:?}")]
    InvalidName(String),

    /// A rendered key could not be split into name and offset.
    #[error("malformed chunk key {0:?}")]
    Malformed(String),
}

/// The cache and routing key of one aligned chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    name: String,
    offset: u64,
}

impl ChunkKey {
    /// Creates a key from an artifact name and an aligned offset.
    pub fn new(name: impl Into<String>, offset: u64) -> Result<Self, ChunkKeyError> {
        let name = name.into();
        if name.contains(CHUNK_KEY_SEP) {
            return Err(ChunkKeyError::InvalidName(name));
        }
        Ok(Self { name, offset })
    }

    /// Creates the key of the chunk containing `offset`, aligning it down
    /// to a multiple of `chunk_size`.
    pub fn containing(
        name: impl Into<String>,
        offset: u64,
        chunk_size: u64,
    ) -> Result<Self, ChunkKeyError> {
        Self::new(name, align_down(offset, chunk_size))
    }

    /// Parses a rendered `<name>_<offset>` key.
    pub fn parse(s: &str) -> Result<Self, ChunkKeyError> {
        let (name, offset) = s
            .split_once(CHUNK_KEY_SEP)
            .ok_or_else(|| ChunkKeyError::Malformed(s.to_owned()))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|_| ChunkKeyError::Malformed(s.to_owned()))?;
        Self::new(name, offset)
    }

    /// The artifact name (digest string or OCI reference).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The aligned offset of the chunk.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, CHUNK_KEY_SEP, self.offset)
    }
}
