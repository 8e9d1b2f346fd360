//! Peer HTTPS transports.
//!
//! All TLS material derives from the host's libp2p keypair. The server
//! side presents the libp2p identity certificate without requiring
//! client certificates, so the registry listener serves plain clients
//! too. Outbound, the default client is anonymous (origin fetches) and
//! per-peer clients carry a verifier that authenticates the remote by
//! its libp2p peer ID. Per-peer clients are built fresh per request and
//! never cached across peers.

use std::sync::{Arc, Once};
use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::PeerId;
use thiserror::Error;

/// Total HTTP timeout that should cover a 1 MiB chunk transfer from
/// most peers.
pub const PEER_HTTP_TIMEOUT: Duration = Duration::from_secs(90);

/// Errors building transports.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("tls identity: {0}")]
    Identity(String),

    #[error("tls server config: {0}")]
    ServerConfig(#[from] rustls::Error),

    #[error("http client")]
    Client(#[from] reqwest::Error),
}

/// Factory for the HTTPS transports used between peers.
pub struct PeerNetwork {
    keypair: Keypair,
    server_config: Arc<rustls::ServerConfig>,
    default_client: reqwest::Client,
}

impl PeerNetwork {
    pub fn new(keypair: &Keypair) -> Result<Self, NetError> {
        ensure_crypto_provider();

        let (certificate, private_key) = libp2p::tls::certificate::generate(keypair)
            .map_err(|e| NetError::Identity(e.to_string()))?;
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![certificate], private_key)?;
        server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let default_client = reqwest::Client::builder()
            .timeout(PEER_HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            keypair: keypair.clone(),
            server_config: Arc::new(server_config),
            default_client,
        })
    }

    /// TLS config for the registry listener. Reusable; does not verify
    /// client certificates.
    pub fn server_config(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// The process-wide anonymous client, used against origins.
    pub fn default_client(&self) -> reqwest::Client {
        self.default_client.clone()
    }

    /// A single-use client that only accepts the given peer's identity
    /// certificate.
    pub fn client_for(&self, peer: &PeerId) -> Result<reqwest::Client, NetError> {
        let mut tls = libp2p::tls::make_client_config(&self.keypair, Some(*peer))
            .map_err(|e| NetError::Identity(e.to_string()))?;
        // The libp2p handshake negotiates "libp2p"; these connections
        // speak HTTP over the same certificates.
        tls.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .timeout(PEER_HTTP_TIMEOUT)
            .build()?)
    }
}

fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_transports_from_a_fresh_identity() {
        let keypair = Keypair::generate_ed25519();
        let net = PeerNetwork::new(&keypair).unwrap();
        assert!(!net.server_config().alpn_protocols.is_empty());

        let other = PeerId::from(Keypair::generate_ed25519().public());
        net.client_for(&other).unwrap();
        let _ = net.default_client();
    }
}
