use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChannelLabels {
    pub outcome: ChannelOutcome,
}

/// How a proxied channel ended.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ChannelOutcome {
    /// Both peers closed the channel after relaying.
    Completed,
    /// The client went away before a route was chosen.
    PeerClosed,
    Timeout,
    NoProject,
    NotFound,
    ResolverError,
    UpstreamError,
    ForwardingError,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the router.
pub struct Metrics {
    // -- connections --
    pub connections_total: Counter,
    pub handshake_failures_total: Counter,

    // -- channels --
    pub active_channels: Gauge,
    pub channels_total: Family<ChannelLabels, Counter>,

    // -- latency --
    pub resolve_duration_seconds: Histogram,
    pub upstream_connect_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let connections_total = Counter::default();
        registry.register(
            "ssh_router_connections",
            "Accepted SSH transport connections",
            connections_total.clone(),
        );

        let handshake_failures_total = Counter::default();
        registry.register(
            "ssh_router_handshake_failures",
            "SSH server handshakes that failed or ended in error",
            handshake_failures_total.clone(),
        );

        let active_channels: Gauge = Gauge::default();
        registry.register(
            "ssh_router_active_channels",
            "Session channels currently being routed or relayed",
            active_channels.clone(),
        );

        let channels_total = Family::<ChannelLabels, Counter>::default();
        registry.register(
            "ssh_router_channels",
            "Finished session channels by outcome",
            channels_total.clone(),
        );

        let resolve_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "ssh_router_resolve_duration_seconds",
            "Project route lookup latency in seconds",
            resolve_duration_seconds.clone(),
        );

        let upstream_connect_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 14));
        registry.register(
            "ssh_router_upstream_connect_duration_seconds",
            "Dial + handshake + channel open latency towards backends in seconds",
            upstream_connect_duration_seconds.clone(),
        );

        Self {
            connections_total,
            handshake_failures_total,
            active_channels,
            channels_total,
            resolve_duration_seconds,
            upstream_connect_duration_seconds,
        }
    }

    pub fn record_channel(&self, outcome: ChannelOutcome) {
        self.channels_total
            .get_or_create(&ChannelLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all router metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
