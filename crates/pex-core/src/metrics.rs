//! Metric sinks recorded by the data plane.
//!
//! The trait keeps the hot path free of any registry dependency; the
//! Prometheus-backed implementation lives in the API crate. Sinks never
//! fail and never block.

use std::sync::Arc;

/// Collector for data plane metrics.
pub trait Metrics: Send + Sync {
    /// Records the time taken to process one inbound request.
    fn record_request(&self, method: &str, handler: &str, seconds: f64);

    /// Records the time taken to discover the first peer for a key.
    fn record_peer_discovery(&self, ip: &str, seconds: f64);

    /// Records a successful peer response: duration and byte count.
    fn record_peer_response(&self, ip: &str, op: &str, seconds: f64, bytes: u64);

    /// Records an upstream (origin) response: duration and byte count.
    fn record_upstream_response(&self, hostname: &str, op: &str, seconds: f64, bytes: u64);
}

/// A sink that drops everything. Used in tests and as a default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_request(&self, _method: &str, _handler: &str, _seconds: f64) {}
    fn record_peer_discovery(&self, _ip: &str, _seconds: f64) {}
    fn record_peer_response(&self, _ip: &str, _op: &str, _seconds: f64, _bytes: u64) {}
    fn record_upstream_response(&self, _hostname: &str, _op: &str, _seconds: f64, _bytes: u64) {}
}

impl Metrics for Arc<dyn Metrics> {
    fn record_request(&self, method: &str, handler: &str, seconds: f64) {
        (**self).record_request(method, handler, seconds);
    }
    fn record_peer_discovery(&self, ip: &str, seconds: f64) {
        (**self).record_peer_discovery(ip, seconds);
    }
    fn record_peer_response(&self, ip: &str, op: &str, seconds: f64, bytes: u64) {
        (**self).record_peer_response(ip, op, seconds, bytes);
    }
    fn record_upstream_response(&self, hostname: &str, op: &str, seconds: f64, bytes: u64) {
        (**self).record_upstream_response(hostname, op, seconds, bytes);
    }
}
