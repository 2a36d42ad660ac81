use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    core::Collector, CounterVec, Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));

/// Metrics collection for Pulsar Signaling
pub struct Metrics {
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: Gauge,
    pub connections_closed: CounterVec,

    // Protocol metrics
    pub packets_received: CounterVec,
    pub relays_total: CounterVec,

    // Lobby metrics
    pub lobbies_created: IntCounter,
    pub lobby_joins: CounterVec,

    // Reconnection metrics
    pub reconnects: CounterVec,
    pub disconnects_recorded: IntCounter,
    pub sweep_evictions: IntCounter,
    pub sweep_failures: IntCounter,

    // Collaborators
    pub credentials_requests: CounterVec,
    pub events_total: CounterVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    register(registry, IntCounter::new(name, help).expect("valid metric"))
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    register(
        registry,
        CounterVec::new(Opts::new(name, help), labels).expect("valid metric"),
    )
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = counter(
            &registry,
            "signaling_connections_total",
            "Total number of accepted signaling connections",
        );
        let connections_active = register(
            &registry,
            Gauge::new("signaling_connections_active", "Currently open signaling connections")
                .expect("valid metric"),
        );
        let connections_closed = counter_vec(
            &registry,
            "signaling_connections_closed_total",
            "Closed connections by how they ended",
            &["reason"],
        );

        let packets_received = counter_vec(
            &registry,
            "signaling_packets_received_total",
            "Inbound packets by type",
            &["type"],
        );
        let relays_total = counter_vec(
            &registry,
            "signaling_relays_total",
            "Relay envelopes by outcome",
            &["result"],
        );

        let lobbies_created = counter(
            &registry,
            "signaling_lobbies_created_total",
            "Total number of lobbies created",
        );
        let lobby_joins = counter_vec(
            &registry,
            "signaling_lobby_joins_total",
            "Lobby join attempts by outcome",
            &["result"],
        );

        let reconnects = counter_vec(
            &registry,
            "signaling_reconnects_total",
            "Identity claims by outcome",
            &["result"],
        );
        let disconnects_recorded = counter(
            &registry,
            "signaling_disconnects_recorded_total",
            "Abrupt disconnects entering the grace window",
        );
        let sweep_evictions = counter(
            &registry,
            "signaling_sweep_evictions_total",
            "Peers evicted after the grace window elapsed",
        );
        let sweep_failures = counter(
            &registry,
            "signaling_sweep_failures_total",
            "Sweep ticks that failed to reach the store",
        );

        let credentials_requests = counter_vec(
            &registry,
            "signaling_credentials_requests_total",
            "TURN credential requests by outcome",
            &["result"],
        );
        let events_total = counter_vec(
            &registry,
            "signaling_client_events_total",
            "Client telemetry events by category",
            &["category"],
        );

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            packets_received,
            relays_total,
            lobbies_created,
            lobby_joins,
            reconnects,
            disconnects_recorded,
            sweep_evictions,
            sweep_failures,
            credentials_requests,
            events_total,
        }
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
