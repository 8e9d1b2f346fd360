//! Content digests.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").unwrap());

/// Errors from digest parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DigestError {
    #[error("invalid digest {0:?}")]
    Invalid(String),
}

/// An algorithm-qualified content digest, e.g. `sha256:ab12...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        if !DIGEST_RE.is_match(s) {
            return Err(DigestError::Invalid(s.to_owned()));
        }
        if let Some(hex) = s.strip_prefix("sha256:") {
            if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(DigestError::Invalid(s.to_owned()));
            }
        }
        Ok(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK: &str = "sha256:d18c7a64c5158179bdee531a663c5b487de57ff17cff3af29a51c7e70b491d9d";

    #[test]
    fn accepts_well_formed_sha256() {
        assert_eq!(Digest::parse(OK).unwrap().as_str(), OK);
    }

    #[test]
    fn rejects_bad_shapes() {
        for bad in [
            "",
            "sha256",
            "sha256:",
            "sha256:short",
            "sha256:Z18c7a64c5158179bdee531a663c5b487de57ff17cff3af29a51c7e70b491d9d",
            "no digest here",
        ] {
            assert!(Digest::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
