//! The OCI distribution v2 URL grammar.
//!
//! Parses `/v2/<name>/manifests/<tag-or-digest>` and
//! `/v2/<name>/blobs/<digest>` into the reference or digest being asked
//! for. Pure functions; the handlers own all I/O.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::digest::{Digest, DigestError};

const NAME: &str = r"[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*";
const TAG: &str = r"[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}";

static MANIFEST_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^/v2/(?P<name>{NAME})/manifests/(?P<tag>{TAG})$")).unwrap());
static MANIFEST_DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^/v2/(?P<name>{NAME})/manifests/(?P<digest>.+)$")).unwrap());
static BLOB_DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^/v2/(?P<name>{NAME})/blobs/(?P<digest>.+)$")).unwrap());

/// Whether a path names a manifest or a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceType {
    Manifest,
    Blob,
}

/// Parsed components of a distribution path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathComponents {
    /// `<registry>/<name>:<tag>` for tag-addressed manifests.
    pub reference: Option<String>,
    /// The digest for digest-addressed manifests and blobs.
    pub digest: Option<Digest>,
    pub ref_type: ReferenceType,
}

/// Errors from path parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("distribution path {0:?} could not be parsed")]
    Unparseable(String),
    #[error("registry parameter needs to be set for tag references")]
    RegistryRequired,
    #[error(transparent)]
    Digest(#[from] DigestError),
}

/// Parses the registry-relative request path of a `/v2/*` request.
pub fn parse_path_components(registry: &str, path: &str) -> Result<PathComponents, PathError> {
    if let Some(caps) = MANIFEST_TAG_RE.captures(path) {
        if registry.is_empty() {
            return Err(PathError::RegistryRequired);
        }
        return Ok(PathComponents {
            reference: Some(format!("{registry}/{}:{}", &caps["name"], &caps["tag"])),
            digest: None,
            ref_type: ReferenceType::Manifest,
        });
    }
    if let Some(caps) = MANIFEST_DIGEST_RE.captures(path) {
        return Ok(PathComponents {
            reference: None,
            digest: Some(Digest::parse(&caps["digest"])?),
            ref_type: ReferenceType::Manifest,
        });
    }
    if let Some(caps) = BLOB_DIGEST_RE.captures(path) {
        return Ok(PathComponents {
            reference: None,
            digest: Some(Digest::parse(&caps["digest"])?),
            ref_type: ReferenceType::Blob,
        });
    }
    Err(PathError::Unparseable(path.to_owned()))
}
