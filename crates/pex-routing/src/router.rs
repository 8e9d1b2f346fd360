//! The content router: trait, handle, and errors.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::actor::{Actor, Command};
use crate::events::EventRecorder;
use crate::leader::Leader;
use crate::negative::NegativeCache;
use crate::NEGATIVE_LOOKUP_TTL;

/// Errors from content routing.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The negative cache holds a not-found sentinel for the key.
    #[error("peer not found for key {0:?} (cached)")]
    PeerNotFound(String),

    /// The router actor has shut down.
    #[error("router closed")]
    Closed,

    /// The libp2p host could not be brought up. Fatal at bootstrap.
    #[error("router bootstrap: {0}")]
    Bootstrap(String),

    /// A leader address could not be obtained or understood.
    #[error("leader unavailable: {0}")]
    Leader(String),
}

/// One peer that can serve a resolved key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Stable libp2p peer ID; authenticated by the per-peer transport.
    pub id: PeerId,
    /// `https://<peer-ip>:<registry-port>`.
    pub endpoint: String,
}

/// Callback handed out by `resolve_with_cache`; the caller invokes
/// [`NotFoundMark::mark`] when the peer stream ends without a usable
/// peer, inserting the not-found sentinel.
pub struct NotFoundMark {
    cache: Arc<NegativeCache>,
    key: String,
}

impl NotFoundMark {
    pub fn new(cache: Arc<NegativeCache>, key: impl Into<String>) -> Self {
        Self {
            cache,
            key: key.into(),
        }
    }

    /// Records that the key resolved to nothing.
    pub fn mark(&self) {
        debug!(key = %self.key, "negative lookup cached");
        self.cache.insert(&self.key);
    }
}

/// Resolution and publication of content keys in the routing overlay.
#[async_trait]
pub trait ContentRouter: Send + Sync {
    /// Resolves `key` to a stream of peers. The stream closes when the
    /// lookup finishes; a timeout is the caller's concern, not an error.
    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>, RouteError>;

    /// Like [`ContentRouter::resolve`], but fails fast with
    /// [`RouteError::PeerNotFound`] while the negative cache holds a
    /// sentinel for `key`, and returns the mark to insert one.
    async fn resolve_with_cache(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<(mpsc::Receiver<PeerInfo>, NotFoundMark), RouteError>;

    /// Publishes provider records for the given keys. Per-key failures
    /// are logged, not returned; the batch always runs to completion.
    async fn provide(&self, keys: Vec<String>) -> Result<(), RouteError>;

    /// Shuts the underlying host down.
    async fn close(&self);
}

/// Construction parameters for [`DhtRouter`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// TCP address the libp2p host binds to.
    pub listen_addr: SocketAddr,
    /// Port peers serve their registry on; combined with a provider's
    /// IPv4 address to form its endpoint.
    pub registry_port: u16,
}

/// Handle to the DHT actor task.
pub struct DhtRouter {
    commands: mpsc::Sender<Command>,
    negative: Arc<NegativeCache>,
    local_peer_id: PeerId,
}

impl DhtRouter {
    /// Brings up the libp2p host, starts the actor task, and performs
    /// the initial leader bootstrap.
    pub async fn start(
        config: RouterConfig,
        keypair: Keypair,
        leader: Arc<dyn Leader>,
        events: Arc<dyn EventRecorder>,
    ) -> Result<Self, RouteError> {
        let local_peer_id = PeerId::from(keypair.public());
        let (commands_tx, commands_rx) = mpsc::channel(64);

        let actor = Actor::new(config, keypair, leader, events, commands_rx)?;
        tokio::spawn(actor.run());

        Ok(Self {
            commands: commands_tx,
            negative: Arc::new(NegativeCache::new(NEGATIVE_LOOKUP_TTL)),
            local_peer_id,
        })
    }

    /// The host's own peer ID.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// The host's own multiaddr, once listening.
    pub async fn listen_addr(&self) -> Result<Multiaddr, RouteError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.commands
            .send(Command::ListenAddr { tx })
            .await
            .map_err(|_| RouteError::Closed)?;
        rx.await.map_err(|_| RouteError::Closed)
    }
}

#[async_trait]
impl ContentRouter for DhtRouter {
    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>, RouteError> {
        let (tx, rx) = mpsc::channel(count.max(1));
        self.commands
            .send(Command::Resolve {
                key: key.to_owned(),
                allow_self,
                count: count.max(1),
                tx,
            })
            .await
            .map_err(|_| RouteError::Closed)?;
        Ok(rx)
    }

    async fn resolve_with_cache(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<(mpsc::Receiver<PeerInfo>, NotFoundMark), RouteError> {
        if self.negative.contains(key) {
            return Err(RouteError::PeerNotFound(key.to_owned()));
        }
        let rx = self.resolve(key, allow_self, count).await?;
        Ok((rx, NotFoundMark::new(Arc::clone(&self.negative), key)))
    }

    async fn provide(&self, keys: Vec<String>) -> Result<(), RouteError> {
        self.commands
            .send(Command::Provide { keys })
            .await
            .map_err(|_| RouteError::Closed)
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }
}
