//! Cluster lifecycle event sinks.
//!
//! The original deployment records these as Kubernetes node events; the
//! interface is all the core consumes. Sinks are idempotent and never
//! fail.

use tracing::info;

/// Records node lifecycle events for cluster observability.
pub trait EventRecorder: Send + Sync {
    /// The node is initializing.
    fn initializing(&self);
    /// The node is connected to the cluster.
    fn connected(&self);
    /// The node served or discovered its first peer.
    fn active(&self);
    /// The node lost its connection to the cluster.
    fn disconnected(&self);
    /// The node failed to come up.
    fn failed(&self);
}

/// Event recorder that writes structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn initializing(&self) {
        info!(event = "initializing", "cluster event");
    }
    fn connected(&self) {
        info!(event = "connected", "cluster event");
    }
    fn active(&self) {
        info!(event = "active", "cluster event");
    }
    fn disconnected(&self) {
        info!(event = "disconnected", "cluster event");
    }
    fn failed(&self) {
        info!(event = "failed", "cluster event");
    }
}
