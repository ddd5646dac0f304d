//! Prometheus metrics, exposed on `/metrics`

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_int_gauge_with_registry, CounterVec, Encoder, HistogramVec, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Relayed unary requests by outcome (`resolved`, `timeout`, `missing_session`, ...)
pub static RELAY_REQUESTS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "relay_requests_total",
        "Total number of relayed unary requests",
        &["outcome", "status"],
        REGISTRY.clone()
    )
    .expect("Failed to register RELAY_REQUESTS_TOTAL")
});

/// Time from publish to resolution
pub static RELAY_DURATION: std::sync::LazyLock<HistogramVec> = std::sync::LazyLock::new(|| {
    register_histogram_vec_with_registry!(
        "relay_duration_seconds",
        "Time between publishing a request envelope and resolving the caller",
        &["outcome"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        REGISTRY.clone()
    )
    .expect("Failed to register RELAY_DURATION")
});

/// Sessions registered on this instance
pub static ACTIVE_SESSIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "active_sessions",
        "Current number of sessions registered on this instance",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_SESSIONS")
});

/// Streaming connections currently open on this instance
pub static ACTIVE_STREAMS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "active_streams",
        "Current number of open streaming connections on this instance",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_STREAMS")
});

/// Closed streaming connections by close reason
pub static STREAMS_CLOSED_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "streams_closed_total",
        "Total number of closed streaming connections",
        &["reason"],
        REGISTRY.clone()
    )
    .expect("Failed to register STREAMS_CLOSED_TOTAL")
});

/// Broker operation failures
pub static BROKER_ERRORS_TOTAL: std::sync::LazyLock<CounterVec> = std::sync::LazyLock::new(|| {
    register_counter_vec_with_registry!(
        "broker_errors_total",
        "Total number of failed broker operations",
        &["operation"],
        REGISTRY.clone()
    )
    .expect("Failed to register BROKER_ERRORS_TOTAL")
});

/// Expose metrics in Prometheus format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}
