//! Scripted router for tests.
//!
//! Resolves from a fixed table, records everything provided, and shares
//! the production negative-cache behavior so callers can exercise the
//! not-found path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::negative::NegativeCache;
use crate::router::{ContentRouter, NotFoundMark, PeerInfo, RouteError};
use crate::NEGATIVE_LOOKUP_TTL;

/// In-memory [`ContentRouter`] double.
#[derive(Default)]
pub struct MockRouter {
    peers: Mutex<HashMap<String, Vec<PeerInfo>>>,
    provided: Mutex<Vec<String>>,
    resolved: Mutex<Vec<String>>,
    /// Keys whose resolution should stay open without yielding peers,
    /// to exercise caller-side timeouts.
    hold_open: Mutex<Vec<String>>,
    negative: Arc<NegativeCache>,
}

impl MockRouter {
    pub fn new() -> Self {
        Self {
            negative: Arc::new(NegativeCache::new(NEGATIVE_LOOKUP_TTL)),
            ..Self::default()
        }
    }

    /// Scripts the peers returned for `key`.
    pub fn set_peers(&self, key: &str, peers: Vec<PeerInfo>) {
        self.peers.lock().insert(key.to_owned(), peers);
    }

    /// Makes resolutions of `key` hang without an answer.
    pub fn hold_open(&self, key: &str) {
        self.hold_open.lock().push(key.to_owned());
    }

    /// Every key provided so far, in order.
    pub fn provided_keys(&self) -> Vec<String> {
        self.provided.lock().clone()
    }

    /// Every key resolution attempted so far, in order.
    pub fn resolved_keys(&self) -> Vec<String> {
        self.resolved.lock().clone()
    }

    /// The peers scripted for `key`, if any were looked up before.
    pub fn lookup(&self, key: &str) -> Option<Vec<PeerInfo>> {
        self.peers.lock().get(key).cloned()
    }
}

#[async_trait]
impl ContentRouter for MockRouter {
    async fn resolve(
        &self,
        key: &str,
        _allow_self: bool,
        count: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>, RouteError> {
        self.resolved.lock().push(key.to_owned());
        let (tx, rx) = mpsc::channel(count.max(1));
        if self.hold_open.lock().iter().any(|k| k == key) {
            // Park the sender so the stream never closes.
            tokio::spawn(async move {
                let _tx = tx;
                std::future::pending::<()>().await;
            });
            return Ok(rx);
        }
        let peers = self.peers.lock().get(key).cloned().unwrap_or_default();
        for peer in peers {
            let _ = tx.try_send(peer);
        }
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
        self.provided.lock().extend(keys);
        Ok(())
    }

    async fn close(&self) {}
}
