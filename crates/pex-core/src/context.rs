//! Per-request context and the peer wire headers.
//!
//! Every inbound request is tagged at the ingress with a correlation ID,
//! the from-peer flag, and the sending node's name. The context is moved
//! through the handler stages; outbound peer requests carry the same
//! headers with the from-peer flag forced on.

use thiserror::Error;
use uuid::Uuid;

/// Marks a peer-originated request. Absent or any value other than
/// `"true"` means the request came from a regular client.
pub const PEER_HEADER: &str = "X-MS-Peerd-RequestFromPeer";

/// Opaque request correlation ID, echoed on responses and propagated to
/// peers and origin.
pub const CORRELATION_HEADER: &str = "X-MS-Peerd-CorrelationId";

/// Name of the sending node.
pub const NODE_HEADER: &str = "X-MS-Peerd-Node";

/// Context attached to one inbound request at the ingress.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation ID, taken from the request or freshly minted.
    pub correlation_id: String,
    /// Whether the request was sent by a peer node.
    pub from_peer: bool,
    /// The sending peer's node name, when it identified itself.
    pub peer_node: Option<String>,
}

impl RequestContext {
    /// Builds a context from the raw header values of an inbound request.
    pub fn from_headers(
        correlation_id: Option<&str>,
        from_peer: Option<&str>,
        peer_node: Option<&str>,
    ) -> Self {
        let correlation_id = match correlation_id {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => Uuid::new_v4().to_string(),
        };
        Self {
            correlation_id,
            from_peer: from_peer == Some("true"),
            peer_node: peer_node.map(str::to_owned),
        }
    }
}

/// Errors from `Range` header parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("no range header")]
    Missing,
    #[error("invalid range format {0:?}")]
    Invalid(String),
}

/// Returns the start index of a `Range` header value of the form
/// `bytes=<start>-<end>`.
pub fn range_start(value: &str) -> Result<u64, RangeError> {
    if value.is_empty() {
        return Err(RangeError::Missing);
    }
    let spec = value
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Invalid(value.to_owned()))?;
    let (start, _end) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Invalid(value.to_owned()))?;
    start
        .parse::<u64>()
        .map_err(|_| RangeError::Invalid(value.to_owned()))
}

/// Resolves a `Range` header value against an artifact of `size` bytes
/// into an inclusive `(start, end)` span. Open-ended ranges
/// (`bytes=17-`) run to the end; `end` is clamped to the last byte.
pub fn range_span(value: &str, size: u64) -> Result<(u64, u64), RangeError> {
    let start = range_start(value)?;
    if size == 0 || start >= size {
        return Err(RangeError::Invalid(value.to_owned()));
    }
    let spec = value.strip_prefix("bytes=").unwrap_or(value);
    let end = match spec.split_once('-').map(|(_, end)| end) {
        Some("") | None => size - 1,
        Some(end) => end
            .parse::<u64>()
            .map_err(|_| RangeError::Invalid(value.to_owned()))?
            .min(size - 1),
    };
    if start > end {
        return Err(RangeError::Invalid(value.to_owned()));
    }
    Ok((start, end))
}
