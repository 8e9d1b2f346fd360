//! OCI artifact references.
//!
//! A reference names an artifact in the local store:
//! `docker.io/library/ubuntu:latest@sha256:...` or
//! `docker.io/library/ubuntu@sha256:...`. The digest may also be
//! supplied out of band (the store knows it even when the name does
//! not carry one).

use std::fmt;

use thiserror::Error;

use crate::digest::{Digest, DigestError};

/// Errors from reference parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid reference {0:?}")]
    Invalid(String),
    #[error("hostname required in {0:?}")]
    HostRequired(String),
    #[error(transparent)]
    Digest(#[from] DigestError),
    #[error("reference {0:?} carries no digest")]
    MissingDigest(String),
}

/// A fully resolved reference: host, repository, optional tag, digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    host: String,
    repository: String,
    tag: Option<String>,
    digest: Digest,
}

impl Reference {
    /// Parses `name`, taking the digest from the name's `@` suffix or,
    /// failing that, from `target_digest`.
    pub fn parse(name: &str, target_digest: Option<&Digest>) -> Result<Self, ReferenceError> {
        if name.contains("://") {
            return Err(ReferenceError::Invalid(name.to_owned()));
        }

        let (base, digest_str) = match name.split_once('@') {
            Some((base, digest)) => (base, Some(digest)),
            None => (name, None),
        };

        let (path, tag) = match base.rsplit_once(':') {
            // A colon inside the path portion is a port, not a tag.
            Some((path, tag)) if !tag.contains('/') => (path, Some(tag.to_owned())),
            _ => (base, None),
        };

        let (host, repository) = path
            .split_once('/')
            .ok_or_else(|| ReferenceError::HostRequired(name.to_owned()))?;
        if host.is_empty() || repository.is_empty() {
            return Err(ReferenceError::Invalid(name.to_owned()));
        }

        let digest = match digest_str {
            Some(d) => Digest::parse(d)?,
            None => target_digest
                .cloned()
                .ok_or_else(|| ReferenceError::MissingDigest(name.to_owned()))?,
        };

        Ok(Self {
            host: host.to_owned(),
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }

    /// `<host>/<repository>`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.host, self.repository)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl fmt::Display for Reference {
    /// `host/repo:tag` when tagged, `host/repo@digest` otherwise.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}/{}:{}", self.host, self.repository, tag),
            None => write!(f, "{}/{}@{}", self.host, self.repository, self.digest),
        }
    }
}
