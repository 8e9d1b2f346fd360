//! Shared application state.
//!
//! Everything the handlers touch is wired here at construction; there
//! is no global state anywhere in the data plane.

use std::sync::Arc;
use std::time::Duration;

use pex_core::Metrics;
use pex_files::FilesStore;
use pex_oci::OciStore;
use pex_routing::{ContentRouter, PeerNetwork};

use crate::metrics::PromMetrics;

/// API-level tunables.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// This node's name, echoed on responses and outbound requests.
    pub node_name: String,
    /// Peer resolution budget for the v2 mirror.
    pub mirror_resolve_timeout: Duration,
    /// Peers requested per mirror resolution.
    pub mirror_resolve_retries: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            node_name: "pex".to_owned(),
            mirror_resolve_timeout: Duration::from_secs(1),
            mirror_resolve_retries: 3,
        }
    }
}

/// State handed to every handler via the `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub files: Arc<FilesStore>,
    pub oci: Arc<dyn OciStore>,
    pub router: Arc<dyn ContentRouter>,
    pub network: Arc<PeerNetwork>,
    pub metrics: Arc<dyn Metrics>,
    /// Present when metrics are Prometheus-backed; serves `/metrics`.
    pub prom: Option<Arc<PromMetrics>>,
    pub config: ApiConfig,
}
