//! Hub observability surface.
//!
//! One registry per process, built in `main` and threaded through the hub
//! (no default-registry globals, so tests can build as many as they like).

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

pub struct HubMetrics {
    registry: Registry,
    pub active_connections: IntGauge,
    pub active_rooms: IntGauge,
    pub subscribe_queue_depth: IntGauge,
    pub subscribe_timeouts: IntCounter,
    pub messages_sent: IntCounterVec,
    pub typing_coalesced: IntCounter,
    pub broadcast_duration: Histogram,
    pub pipeline_latency: HistogramVec,
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub cache_latency: HistogramVec,
}

impl HubMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_connections = IntGauge::new(
            "hub_active_connections",
            "Number of websocket clients currently connected",
        )
        .expect("metric definition");
        let active_rooms =
            IntGauge::new("hub_active_rooms", "Number of live rooms").expect("metric definition");
        let subscribe_queue_depth = IntGauge::new(
            "hub_subscribe_queue_depth",
            "Room-join requests waiting for a subscribe worker",
        )
        .expect("metric definition");
        let subscribe_timeouts = IntCounter::new(
            "hub_subscribe_timeouts_total",
            "Room-join requests dropped because the subscribe queue was full",
        )
        .expect("metric definition");
        let messages_sent = IntCounterVec::new(
            Opts::new("hub_messages_sent_total", "Broadcast frames sent, by event"),
            &["event"],
        )
        .expect("metric definition");
        let typing_coalesced = IntCounter::new(
            "hub_typing_coalesced_total",
            "Coalesced typing broadcasts flushed",
        )
        .expect("metric definition");
        let broadcast_duration = Histogram::with_opts(
            HistogramOpts::new(
                "hub_broadcast_duration_seconds",
                "Time to prepare and fan out one batch",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )
        .expect("metric definition");
        let pipeline_latency = HistogramVec::new(
            HistogramOpts::new(
                "hub_pipeline_latency_seconds",
                "Client frame ingest to broadcast fan-out, by event",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["event"],
        )
        .expect("metric definition");
        let cache_hits = IntCounterVec::new(
            Opts::new("hub_cache_hits_total", "Cache reads that found an entry, by key family"),
            &["key"],
        )
        .expect("metric definition");
        let cache_misses = IntCounterVec::new(
            Opts::new("hub_cache_misses_total", "Cache reads that missed or errored, by key family"),
            &["key"],
        )
        .expect("metric definition");
        let cache_latency = HistogramVec::new(
            HistogramOpts::new(
                "hub_cache_latency_seconds",
                "Cache read round-trip time, by key family",
            )
            .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
            &["key"],
        )
        .expect("metric definition");

        for collector in [
            Box::new(active_connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(active_rooms.clone()),
            Box::new(subscribe_queue_depth.clone()),
            Box::new(subscribe_timeouts.clone()),
            Box::new(messages_sent.clone()),
            Box::new(typing_coalesced.clone()),
            Box::new(broadcast_duration.clone()),
            Box::new(pipeline_latency.clone()),
            Box::new(cache_hits.clone()),
            Box::new(cache_misses.clone()),
            Box::new(cache_latency.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        HubMetrics {
            registry,
            active_connections,
            active_rooms,
            subscribe_queue_depth,
            subscribe_timeouts,
            messages_sent,
            typing_coalesced,
            broadcast_duration,
            pipeline_latency,
            cache_hits,
            cache_misses,
            cache_latency,
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders_all_hub_metrics() {
        let metrics = HubMetrics::new();
        metrics.active_connections.inc();
        metrics.messages_sent.with_label_values(&["room.typing"]).inc();
        metrics.broadcast_duration.observe(0.002);

        let text = metrics.render();
        assert!(text.contains("hub_active_connections 1"));
        assert!(text.contains("hub_messages_sent_total{event=\"room.typing\"} 1"));
        assert!(text.contains("hub_broadcast_duration_seconds_bucket"));
    }

    #[test]
    fn cache_metrics_render_by_key_family() {
        let metrics = HubMetrics::new();
        metrics.cache_hits.with_label_values(&["membership:server"]).inc();
        metrics.cache_misses.with_label_values(&["user:info"]).inc();
        metrics.cache_latency.with_label_values(&["user:info"]).observe(0.001);

        let text = metrics.render();
        assert!(text.contains("hub_cache_hits_total{key=\"membership:server\"} 1"));
        assert!(text.contains("hub_cache_misses_total{key=\"user:info\"} 1"));
        assert!(text.contains("hub_cache_latency_seconds_bucket"));
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let a = HubMetrics::new();
        let b = HubMetrics::new();
        a.active_rooms.inc();
        assert!(b.render().contains("hub_active_rooms 0"));
    }
}
