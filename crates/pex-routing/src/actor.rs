//! The swarm actor.
//!
//! Owns the libp2p swarm and the Kademlia behaviour; everything else
//! talks to it through [`Command`]s. Provider lookups are tracked per
//! query ID and stream their results into the caller's channel; the
//! channel closing is the only completion signal (timeouts live with the
//! caller).
//!
//! rust-libp2p reports found providers as bare peer IDs, so the actor
//! keeps an address book fed by routing-table updates and established
//! connections, and only emits providers whose IPv4 address it knows.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::content_id::record_key;
use crate::events::EventRecorder;
use crate::leader::Leader;
use crate::router::{PeerInfo, RouteError, RouterConfig};
use crate::MAX_RECORD_AGE;

/// Cluster-wide DHT protocol name; every node must agree on it.
const PROTOCOL_NAME: &str = "/pex/kad/1.0.0";

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(NetworkBehaviour)]
struct Behaviour {
    kad: kad::Behaviour<MemoryStore>,
}

/// Requests accepted by the actor.
pub(crate) enum Command {
    Resolve {
        key: String,
        allow_self: bool,
        count: usize,
        tx: mpsc::Sender<PeerInfo>,
    },
    Provide {
        keys: Vec<String>,
    },
    ListenAddr {
        tx: oneshot::Sender<Multiaddr>,
    },
    Close,
}

struct PendingResolve {
    tx: mpsc::Sender<PeerInfo>,
    allow_self: bool,
    remaining: usize,
}

pub(crate) struct Actor {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    leader: Arc<dyn Leader>,
    events: Arc<dyn EventRecorder>,
    registry_port: u16,
    pending: HashMap<kad::QueryId, PendingResolve>,
    addresses: HashMap<PeerId, Ipv4Addr>,
    listen_addr: Option<Multiaddr>,
    listen_waiters: Vec<oneshot::Sender<Multiaddr>>,
    active_reported: bool,
}

impl Actor {
    pub(crate) fn new(
        config: RouterConfig,
        keypair: Keypair,
        leader: Arc<dyn Leader>,
        events: Arc<dyn EventRecorder>,
        commands: mpsc::Receiver<Command>,
    ) -> Result<Self, RouteError> {
        let mut swarm = build_swarm(keypair)?;

        let listen: Multiaddr = format!(
            "/ip4/{}/tcp/{}",
            config.listen_addr.ip(),
            config.listen_addr.port()
        )
        .parse()
        .map_err(|e| RouteError::Bootstrap(format!("listen address: {e}")))?;
        swarm
            .listen_on(listen)
            .map_err(|e| RouteError::Bootstrap(format!("listen: {e}")))?;

        info!(peer_id = %swarm.local_peer_id(), "starting p2p router");

        Ok(Self {
            swarm,
            commands,
            leader,
            events,
            registry_port: config.registry_port,
            pending: HashMap::new(),
            addresses: HashMap::new(),
            listen_addr: None,
            listen_waiters: Vec::new(),
            active_reported: false,
        })
    }

    pub(crate) async fn run(mut self) {
        self.bootstrap();
        let mut bootstrap_tick = tokio::time::interval(BOOTSTRAP_INTERVAL);
        bootstrap_tick.tick().await; // the immediate tick; bootstrap already ran

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => break,
                    Some(command) => self.on_command(command),
                },
                _ = bootstrap_tick.tick() => {
                    if self.swarm.connected_peers().count() == 0 {
                        self.bootstrap();
                    }
                },
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }
        debug!("router actor stopped");
    }

    /// Connects to the elected leader, if it is someone else.
    fn bootstrap(&mut self) {
        let addr = match self.leader.leader() {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                debug!("leader is self, skipping connection to bootstrap node");
                self.events.connected();
                return;
            }
            Err(err) => {
                self.events.disconnected();
                warn!(%err, "could not get leader");
                return;
            }
        };

        let Some(peer_id) = peer_id_of(&addr) else {
            self.events.disconnected();
            warn!(%addr, "leader multiaddr carries no peer id");
            return;
        };
        if peer_id == *self.swarm.local_peer_id() {
            debug!("leader is self, skipping connection to bootstrap node");
            self.events.connected();
            return;
        }

        info!(leader = %peer_id, "bootstrap node found");
        let _ = self
            .swarm
            .behaviour_mut()
            .kad
            .add_address(&peer_id, addr);
        if let Err(err) = self.swarm.behaviour_mut().kad.bootstrap() {
            warn!(%err, "dht bootstrap failed");
            self.events.disconnected();
            return;
        }
        self.events.connected();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Resolve {
                key,
                allow_self,
                count,
                tx,
            } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_providers(record_key(&key));
                debug!(key = %key, ?query_id, "provider lookup started");
                self.pending.insert(
                    query_id,
                    PendingResolve {
                        tx,
                        allow_self,
                        remaining: count,
                    },
                );
            }
            Command::Provide { keys } => {
                for key in keys {
                    match self
                        .swarm
                        .behaviour_mut()
                        .kad
                        .start_providing(record_key(&key))
                    {
                        Ok(_) => debug!(key = %key, "providing"),
                        Err(err) => warn!(key = %key, %err, "could not publish provider record"),
                    }
                }
            }
            Command::ListenAddr { tx } => match &self.listen_addr {
                Some(addr) => {
                    let _ = tx.send(addr.clone());
                }
                None => self.listen_waiters.push(tx),
            },
            Command::Close => unreachable!("handled by the run loop"),
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "router listening");
                let full = address
                    .clone()
                    .with(Protocol::P2p(*self.swarm.local_peer_id()));
                for waiter in self.listen_waiters.drain(..) {
                    let _ = waiter.send(full.clone());
                }
                self.listen_addr = Some(full);
                if let Some(ip) = ipv4_of(&address) {
                    let local = *self.swarm.local_peer_id();
                    self.addresses.insert(local, ip);
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                if let Some(ip) = ipv4_of(endpoint.get_remote_address()) {
                    self.addresses.insert(peer_id, ip);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(event)) => self.on_kad_event(event),
            _ => {}
        }
    }

    fn on_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                if let Some(ip) = addresses.iter().find_map(ipv4_of) {
                    self.addresses.insert(peer, ip);
                }
            }
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FoundProviders { providers, .. },
                )) => {
                    self.emit_providers(id, providers);
                    if step.last {
                        self.pending.remove(&id);
                    }
                }
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    self.pending.remove(&id);
                }
                kad::QueryResult::GetProviders(Err(err)) => {
                    debug!(%err, "provider lookup failed");
                    self.pending.remove(&id);
                }
                _ => {
                    if step.last {
                        self.pending.remove(&id);
                    }
                }
            },
            _ => {}
        }
    }

    fn emit_providers(
        &mut self,
        id: kad::QueryId,
        providers: impl IntoIterator<Item = PeerId>,
    ) {
        let local = *self.swarm.local_peer_id();
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };

        let mut emitted_real_peer = false;
        for peer in providers {
            if pending.remaining == 0 {
                break;
            }
            if peer == local && !pending.allow_self {
                continue;
            }
            let Some(ip) = self.addresses.get(&peer) else {
                debug!(%peer, "provider has no known ipv4 address, skipping");
                continue;
            };
            let info = PeerInfo {
                id: peer,
                endpoint: format!("https://{}:{}", ip, self.registry_port),
            };
            if pending.tx.try_send(info).is_err() {
                // Receiver gone or saturated; stop feeding this query.
                pending.remaining = 0;
                break;
            }
            pending.remaining -= 1;
            if peer != local {
                emitted_real_peer = true;
            }
        }

        if pending.remaining == 0 {
            if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                query.finish();
            }
            self.pending.remove(&id);
        }

        if emitted_real_peer && !self.active_reported {
            self.active_reported = true;
            self.events.active();
        }
    }
}

fn build_swarm(keypair: Keypair) -> Result<Swarm<Behaviour>, RouteError> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )
        .map_err(|e| RouteError::Bootstrap(format!("tcp transport: {e}")))?
        .with_behaviour(|key| {
            let local_peer_id = key.public().to_peer_id();
            let mut config = kad::Config::new(StreamProtocol::new(PROTOCOL_NAME));
            config
                .set_query_timeout(QUERY_TIMEOUT)
                .set_provider_record_ttl(Some(MAX_RECORD_AGE))
                .set_provider_publication_interval(None);
            let mut kad = kad::Behaviour::with_config(
                local_peer_id,
                MemoryStore::new(local_peer_id),
                config,
            );
            kad.set_mode(Some(kad::Mode::Server));
            Behaviour { kad }
        })
        .map_err(|e| RouteError::Bootstrap(format!("behaviour: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();
    Ok(swarm)
}

fn ipv4_of(addr: &Multiaddr) -> Option<Ipv4Addr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(ip),
        _ => None,
    })
}

fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
