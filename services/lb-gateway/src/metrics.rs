//! Prometheus metrics exposition (spec §9's ambient stack: "histograms for
//! request latency and counters for selection outcomes, refresh attempts,
//! and usage-refresh outcomes").
//!
//! - `gateway_requests_total` (counter): labels `status`, `method`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_selection_total` (counter): label `outcome` (`selected`, `refused`)
//! - `gateway_refusal_total` (counter): label `reason` (the closed refusal-reason set)
//! - `gateway_usage_refresh_total` (counter): label `outcome` (`success`, `unauthorized`, `deactivated`, `transient`) —
//!   emitted directly by `pool::usage_refresher`, which runs inside the facade rather than this binary's request path
//! - `gateway_stream_failover_total` (counter): label `outcome` (`retried`, `terminal`)

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxied request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str).record(duration_secs);
}

/// Record a selection attempt outcome (`selected` or `refused`).
pub fn record_selection(outcome: &str) {
    metrics::counter!("gateway_selection_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a refusal reason (the closed `RefusalReason` set).
pub fn record_refusal(reason: &str) {
    metrics::counter!("gateway_refusal_total", "reason" => reason.to_string()).increment(1);
}

/// Record a streaming failover decision: `retried` (no bytes sent yet) or
/// `terminal` (bytes already sent, no retry).
pub fn record_stream_failover(outcome: &str) {
    metrics::counter!("gateway_stream_failover_total", "outcome" => outcome.to_string()).increment(1);
}
