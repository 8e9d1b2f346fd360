//! Prometheus-backed metric sinks.
//!
//! Owns its registry so tests never fight over the global default. The
//! speed histograms observe MiB/s rather than raw durations, which is
//! what capacity planning for peer transfers actually wants.

use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};

use pex_core::Metrics;

const MIB: f64 = 1024.0 * 1024.0;

/// [`Metrics`] implementation over a private Prometheus registry.
pub struct PromMetrics {
    node: String,
    registry: Registry,
    request_duration: HistogramVec,
    peer_discovery_duration: HistogramVec,
    peer_response_speed: HistogramVec,
    upstream_response_speed: HistogramVec,
}

impl PromMetrics {
    pub fn new(node: &str) -> Self {
        let registry = Registry::new();

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "pex_request_duration_seconds",
                "Duration of requests in seconds.",
            )
            .buckets(prometheus::exponential_buckets(0.005, 2.0, 14).unwrap()),
            &["self", "method", "handler"],
        )
        .unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();

        let peer_discovery_duration = HistogramVec::new(
            HistogramOpts::new(
                "pex_peer_discovery_duration_seconds",
                "Duration of peer discovery in seconds.",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 12).unwrap()),
            &["self", "ip"],
        )
        .unwrap();
        registry
            .register(Box::new(peer_discovery_duration.clone()))
            .unwrap();

        let peer_response_speed = HistogramVec::new(
            HistogramOpts::new(
                "pex_peer_response_speed_mib_per_second",
                "Speed of peer responses in MiB per second.",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()),
            &["self", "ip", "op"],
        )
        .unwrap();
        registry
            .register(Box::new(peer_response_speed.clone()))
            .unwrap();

        let upstream_response_speed = HistogramVec::new(
            HistogramOpts::new(
                "pex_upstream_response_speed_mib_per_second",
                "Speed of upstream responses in MiB per second.",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 12).unwrap()),
            &["self", "hostname", "op"],
        )
        .unwrap();
        registry
            .register(Box::new(upstream_response_speed.clone()))
            .unwrap();

        Self {
            node: node.to_owned(),
            registry,
            request_duration,
            peer_discovery_duration,
            peer_response_speed,
            upstream_response_speed,
        }
    }

    /// Renders the registry in the text exposition format.
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Metrics for PromMetrics {
    fn record_request(&self, method: &str, handler: &str, seconds: f64) {
        self.request_duration
            .with_label_values(&[&self.node, method, handler])
            .observe(seconds);
    }

    fn record_peer_discovery(&self, ip: &str, seconds: f64) {
        self.peer_discovery_duration
            .with_label_values(&[&self.node, ip])
            .observe(seconds);
    }

    fn record_peer_response(&self, ip: &str, op: &str, seconds: f64, bytes: u64) {
        if seconds <= 0.0 {
            return;
        }
        self.peer_response_speed
            .with_label_values(&[&self.node, ip, op])
            .observe(bytes as f64 / seconds / MIB);
    }

    fn record_upstream_response(&self, hostname: &str, op: &str, seconds: f64, bytes: u64) {
        if seconds <= 0.0 {
            return;
        }
        self.upstream_response_speed
            .with_label_values(&[&self.node, hostname, op])
            .observe(bytes as f64 / seconds / MIB);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_series_show_up_in_the_exposition() {
        let metrics = PromMetrics::new("node-a");
        metrics.record_request("GET", "files", 0.02);
        metrics.record_peer_discovery("10.0.0.4", 0.003);
        metrics.record_peer_response("10.0.0.4", "pread", 0.5, 1024 * 1024);
        metrics.record_upstream_response("origin.example", "fstat", 0.1, 1);

        let text = metrics.gather_text();
        assert!(text.contains("pex_request_duration_seconds"));
        assert!(text.contains("pex_peer_discovery_duration_seconds"));
        assert!(text.contains("pex_peer_response_speed_mib_per_second"));
        assert!(text.contains("pex_upstream_response_speed_mib_per_second"));
        assert!(text.contains("node-a"));
    }
}
