//! Self metrics exported at `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Process-wide metrics.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

pub struct Metrics {
    registry: Registry,
    pub cache_chunks_written: IntCounter,
    pub cache_query_errors: IntCounter,
    pub compacted_chunks: IntCounterVec,
    pub pending_compactions: IntGauge,
    pub collector_rows: IntCounterVec,
    pub collector_flush_errors: IntCounterVec,
    pub notifications_sent: IntCounterVec,
    pub notifications_failed: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new_custom(Some("cerebro".to_string()), None).unwrap_or_else(|_| Registry::new());
        Self {
            cache_chunks_written: counter(&registry, "cache_chunks_written_total", "Chunks written by the metric cache"),
            cache_query_errors: counter(&registry, "cache_query_errors_total", "Failed metric source queries"),
            compacted_chunks: counter_vec(
                &registry,
                "compacted_chunks_total",
                "Chunks produced by compaction",
                &["compactor"],
            ),
            pending_compactions: gauge(&registry, "pending_compactions", "Compaction tasks waiting for a worker"),
            collector_rows: counter_vec(&registry, "collector_rows_total", "Rows flushed to ClickHouse", &["signal"]),
            collector_flush_errors: counter_vec(
                &registry,
                "collector_flush_errors_total",
                "Failed batch flushes",
                &["signal"],
            ),
            notifications_sent: counter_vec(
                &registry,
                "notifications_sent_total",
                "Delivered notifications",
                &["integration"],
            ),
            notifications_failed: counter_vec(
                &registry,
                "notifications_failed_total",
                "Failed notification attempts",
                &["integration"],
            ),
            registry,
        }
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            warn!(target: "cerebro::telemetry", error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

// Descriptors below are static literals, so construction cannot fail;
// registration failures fall back to an unregistered metric.

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(c.clone())) {
        warn!(target: "cerebro::telemetry", name, error = %e, "failed to register metric");
    }
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(g.clone())) {
        warn!(target: "cerebro::telemetry", name, error = %e, "failed to register metric");
    }
    g
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(c.clone())) {
        warn!(target: "cerebro::telemetry", name, error = %e, "failed to register metric");
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_metrics() {
        let m = metrics();
        m.compacted_chunks.with_label_values(&["1h->4h"]).inc();
        m.collector_rows.with_label_values(&["traces"]).inc_by(10);
        let text = m.render();
        assert!(text.contains("cerebro_compacted_chunks_total{compactor=\"1h->4h\"}"));
        assert!(text.contains("cerebro_collector_rows_total"));
    }
}
