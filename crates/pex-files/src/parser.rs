//! Digest recovery from pre-signed blob URLs.
//!
//! The proxy addresses opaque blobs by the digest embedded in their
//! origin URL. Three URL families are understood: Azure Container
//! Registry data endpoints, Microsoft Artifact Registry data endpoints,
//! and Azure Blob Storage registry layouts.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use pex_oci::Digest;

static URL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Azure Container Registry public cloud data endpoints.
        Regex::new(r"https://[a-zA-Z0-9.]+\.azurecr\.[a-z.]+\?[a-zA-Z0-9.&=\-]+&d=sha256:([a-zA-Z0-9]{64})").unwrap(),
        // Microsoft Artifact Registry public cloud data endpoints.
        Regex::new(r"https://[a-zA-Z0-9]+\.data\.mcr\.microsoft\.com/[a-zA-Z0-9\-]+//docker/registry/v2/blobs/sha256/[a-z0-9]{2}/([a-zA-Z0-9]{64})/data").unwrap(),
        // Azure Blob Storage public cloud blob endpoints.
        Regex::new(r"https://[a-zA-Z0-9]+\.blob\.[a-z.]+/[a-zA-Z0-9\-]+//docker/registry/v2/blobs/sha256/[a-z0-9]{2}/([a-zA-Z0-9]{64})/data").unwrap(),
    ]
});

/// Errors from URL digest parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty url")]
    Empty,
    #[error("no digest recognized in url")]
    Unrecognized,
}

/// Recovers the content digest embedded in a blob URL.
pub trait UrlDigestParser: Send + Sync {
    fn parse_digest(&self, url: &str) -> Result<Digest, ParseError>;
}

/// Parser for the Azure URL families.
#[derive(Debug, Default, Clone, Copy)]
pub struct AzureUrlParser;

impl UrlDigestParser for AzureUrlParser {
    fn parse_digest(&self, url: &str) -> Result<Digest, ParseError> {
        if url.is_empty() {
            return Err(ParseError::Empty);
        }
        for re in URL_RES.iter() {
            if let Some(caps) = re.captures(url) {
                let digest = format!("sha256:{}", &caps[1]);
                return Digest::parse(&digest).map_err(|_| ParseError::Unrecognized);
            }
        }
        Err(ParseError::Unrecognized)
    }
}
