//! # Metrics
//!
//! Thin wrappers over the `metrics` facade so metric names and labels live in
//! one place. Without an installed recorder every call is a no-op, which keeps
//! unit tests free of global state.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

use crate::core::circuit_breaker::CircuitPhase;
use crate::core::error::{GatewayError, GatewayResult};

pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const UPSTREAM_LATENCY: &str = "gateway_upstream_latency_seconds";
pub const BREAKER_REJECTIONS: &str = "gateway_circuit_breaker_rejections_total";
pub const BREAKER_TRANSITIONS: &str = "gateway_circuit_breaker_transitions_total";
pub const RATE_LIMITED: &str = "gateway_rate_limited_total";

/// Install the process-wide Prometheus recorder and return its render handle
pub fn install_prometheus_recorder() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| GatewayError::internal(format!("Failed to install metrics recorder: {}", e)))
}

pub fn record_request(route: &str, status: u16) {
    counter!(REQUESTS_TOTAL, "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
}

pub fn record_upstream_latency(route: &str, elapsed: Duration) {
    histogram!(UPSTREAM_LATENCY, "route" => route.to_string()).record(elapsed.as_secs_f64());
}

pub fn record_breaker_rejection(route: &str) {
    counter!(BREAKER_REJECTIONS, "route" => route.to_string()).increment(1);
}

pub fn record_breaker_transition(route: &str, to: CircuitPhase) {
    let phase = match to {
        CircuitPhase::Closed => "closed",
        CircuitPhase::Open => "open",
        CircuitPhase::HalfOpen => "half_open",
    };
    counter!(BREAKER_TRANSITIONS, "route" => route.to_string(), "to" => phase).increment(1);
}

pub fn record_rate_limited() {
    counter!(RATE_LIMITED).increment(1);
}
