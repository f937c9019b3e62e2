//! Prometheus metrics exposition
//!
//! The service records:
//!
//! - `keeper_requests_total` (counter): labels `route`, `status`
//! - `keeper_request_duration_seconds` (histogram): label `route`
//!
//! The token manager adds its own lifecycle counters (`token_*`) to the same
//! recorder.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Validation requests can sit in backoff for tens of seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("keeper_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a completed request with route and status code labels.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("keeper_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("keeper_request_duration_seconds", "route" => route).record(duration_secs);
}
