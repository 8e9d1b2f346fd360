//! Leader lookup.
//!
//! One node per cluster is elected leader and acts as the DHT bootstrap
//! peer. The election itself (a coordination lease in the original
//! deployment) is outside this crate; the router only needs the current
//! leader's multiaddr.

use libp2p::Multiaddr;

use crate::router::RouteError;

/// Source of the elected leader's address.
pub trait Leader: Send + Sync {
    /// Joins the election. The default implementation is a no-op for
    /// deployments with a fixed bootstrap peer.
    fn run_or_die(&self, _id: &str) -> Result<(), RouteError> {
        Ok(())
    }

    /// The current leader's multiaddr, or `None` when this node leads.
    fn leader(&self) -> Result<Option<Multiaddr>, RouteError>;
}

/// A fixed leader: either a configured bootstrap multiaddr, or self.
#[derive(Debug, Clone, Default)]
pub struct StaticLeader {
    addr: Option<Multiaddr>,
}

impl StaticLeader {
    /// Leader at a fixed address.
    pub fn new(addr: Multiaddr) -> Self {
        Self { addr: Some(addr) }
    }

    /// This node is the leader.
    pub fn own() -> Self {
        Self { addr: None }
    }
}

impl Leader for StaticLeader {
    fn leader(&self) -> Result<Option<Multiaddr>, RouteError> {
        Ok(self.addr.clone())
    }
}
