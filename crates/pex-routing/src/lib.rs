//! # pex-routing — content routing over a Kademlia DHT
//!
//! Maps string keys (chunk keys, digests, OCI references) to the peers
//! that can serve them. A key is hashed into a deterministic content ID,
//! published as a DHT provider record, and resolved back into
//! `https://<peer-ip>:<registry-port>` endpoints.
//!
//! The libp2p swarm lives in a dedicated actor task ([`actor`]); the
//! [`DhtRouter`] handle talks to it over a command channel. Failed
//! resolutions are remembered for a short interval in a negative lookup
//! cache so hot misses do not hammer the DHT.
//!
//! [`PeerNetwork`] derives the HTTPS transports from the host's libp2p
//! identity: a server TLS config for the registry listener, an anonymous
//! default client for origin fetches, and per-peer clients that
//! authenticate the remote by its peer ID.

mod actor;
mod content_id;
mod events;
mod leader;
pub mod mock;
mod negative;
mod peernet;
mod router;

use std::time::Duration;

pub use content_id::{content_id, record_key};
pub use events::{EventRecorder, LogRecorder};
pub use leader::{Leader, StaticLeader};
pub use negative::NegativeCache;
pub use peernet::{NetError, PeerNetwork, PEER_HTTP_TIMEOUT};
pub use router::{
    ContentRouter, DhtRouter, NotFoundMark, PeerInfo, RouteError, RouterConfig,
};

/// Maximum age of a provider record in the DHT. The advertiser refreshes
/// everything it can serve one minute before this expires.
pub const MAX_RECORD_AGE: Duration = Duration::from_secs(30 * 60);

/// How long a failed resolution is remembered before the key is looked
/// up again.
pub const NEGATIVE_LOOKUP_TTL: Duration = Duration::from_millis(500);
