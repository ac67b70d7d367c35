use std::sync::OnceLock;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

const MEGA: f64 = 1_000_000.0;
const GIGA: f64 = 1_000_000_000.0;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("chacha_requests_total", "Total processed requests"),
            &["method", "code", "operation"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_operations_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("chacha_cache_operations_total", "Cache operations by outcome"),
            &["type"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_transfer_bytes_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("chacha_cache_transfer_bytes_total", "Bytes served per cache outcome"),
            &["type"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_speed_bytes_per_second() -> &'static HistogramVec {
    static METRIC: OnceLock<HistogramVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let histogram = HistogramVec::new(
            HistogramOpts::new("chacha_cache_speed_bytes_per_second", "Cache transfer speed")
                .buckets(vec![
                    100.0 * MEGA,
                    500.0 * MEGA,
                    1.0 * GIGA,
                    2.5 * GIGA,
                    5.0 * GIGA,
                    7.5 * GIGA,
                    10.0 * GIGA,
                    15.0 * GIGA,
                    20.0 * GIGA,
                    25.0 * GIGA,
                    30.0 * GIGA,
                    35.0 * GIGA,
                    40.0 * GIGA,
                ]),
            &["type"],
        )
        .unwrap();
        registry().register(Box::new(histogram.clone())).unwrap();
        histogram
    })
}

fn cluster_node_health() -> &'static IntGaugeVec {
    static METRIC: OnceLock<IntGaugeVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGaugeVec::new(
            Opts::new("chacha_cluster_node_health", "Cluster node health by last probe"),
            &["node", "status"],
        )
        .unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

pub fn record_request(method: &str, code: u16, operation: &str) {
    requests_total()
        .with_label_values(&[method, &code.to_string(), operation])
        .inc();
}

pub fn record_cache_operation(kind: &str) {
    cache_operations_total().with_label_values(&[kind]).inc();
}

pub fn record_cache_transfer(kind: &str, bytes: u64) {
    cache_transfer_bytes_total()
        .with_label_values(&[kind])
        .inc_by(bytes);
}

pub fn record_cache_speed(kind: &str, bytes_per_second: f64) {
    cache_speed_bytes_per_second()
        .with_label_values(&[kind])
        .observe(bytes_per_second);
}

pub fn set_node_health(node: &str, healthy: bool) {
    let status = if healthy { "healthy" } else { "unhealthy" };
    let other = if healthy { "unhealthy" } else { "healthy" };
    cluster_node_health().with_label_values(&[node, status]).set(1);
    cluster_node_health().with_label_values(&[node, other]).set(0);
}

pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry().gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
