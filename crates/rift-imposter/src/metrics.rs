//! Prometheus metrics for the imposter engine.
//!
//! Tracks requests per imposter, injection activity, proxy latency and
//! bounded-wait expiries.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    /// Requests resolved by imposters
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "rift_imposter_requests_total",
        "Total number of requests resolved by imposters",
        &["port", "protocol", "outcome"]  // outcome: response|default|fault|error|timeout|accepted
    )
    .expect("rift_imposter_requests_total is registered once");

    /// Injected function executions
    pub static ref INJECTIONS_TOTAL: CounterVec = register_counter_vec!(
        "rift_injections_total",
        "Total number of injected function executions",
        &["kind", "result"]  // kind: predicate|response|endOfRequestResolver, result: ok|error
    )
    .expect("rift_injections_total is registered once");

    /// Proxy round-trip duration
    pub static ref PROXY_DURATION_MS: HistogramVec = register_histogram_vec!(
        "rift_proxy_duration_ms",
        "Duration of proxied round trips to real upstreams",
        &["protocol", "result"],
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .expect("rift_proxy_duration_ms is registered once");

    /// Bounded waits that expired
    pub static ref TIMEOUTS_TOTAL: CounterVec = register_counter_vec!(
        "rift_resolution_timeouts_total",
        "Inject or proxy resolutions abandoned after their bounded wait",
        &["port", "source"]  // source: inject|proxy
    )
    .expect("rift_resolution_timeouts_total is registered once");

    /// Imposters currently running
    pub static ref IMPOSTERS_RUNNING: GaugeVec = register_gauge_vec!(
        "rift_imposters_running",
        "Number of imposters currently accepting connections",
        &["protocol"]
    )
    .expect("rift_imposters_running is registered once");
}

/// Collect and return all metrics in Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(port: u16, protocol: &str, outcome: &str) {
    REQUESTS_TOTAL
        .with_label_values(&[&port.to_string(), protocol, outcome])
        .inc();
}

pub fn record_injection(kind: &str, ok: bool) {
    INJECTIONS_TOTAL
        .with_label_values(&[kind, if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_proxy_duration(protocol: &str, ok: bool, duration_ms: f64) {
    PROXY_DURATION_MS
        .with_label_values(&[protocol, if ok { "ok" } else { "error" }])
        .observe(duration_ms);
}

pub fn record_timeout(port: u16, source: &str) {
    TIMEOUTS_TOTAL
        .with_label_values(&[&port.to_string(), source])
        .inc();
}

pub fn imposter_started(protocol: &str) {
    IMPOSTERS_RUNNING.with_label_values(&[protocol]).inc();
}

pub fn imposter_stopped(protocol: &str) {
    IMPOSTERS_RUNNING.with_label_values(&[protocol]).dec();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_recorded_series() {
        record_request(65001, "tcp", "response");
        record_injection("predicate", true);
        record_proxy_duration("http", false, 12.0);
        let text = gather();
        assert!(text.contains("rift_imposter_requests_total"));
        assert!(text.contains("port=\"65001\""));
        assert!(text.contains("rift_injections_total"));
        assert!(text.contains("rift_proxy_duration_ms"));
    }
}
