//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_dispatch_total` (counter): dispatches by service, status
//! - `gateway_dispatch_duration_seconds` (histogram): end-to-end latency
//! - `gateway_retries_total` (counter): failed attempts by service, error kind
//! - `gateway_pool_leased_connections` / `gateway_pool_idle_connections` (gauges)
//! - `gateway_endpoint_health` (gauge): 1=healthy, 0=unhealthy
//! - `gateway_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `gateway_dedup_joins_total`, `gateway_cancellations_total` (counters)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::time::Instant;

use crate::resilience::CircuitState;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_dispatch(service: &str, status: &'static str, started: Instant) {
    counter!("gateway_dispatch_total", "service" => service.to_string(), "status" => status)
        .increment(1);
    histogram!("gateway_dispatch_duration_seconds", "service" => service.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_retry(service: &str, kind: &'static str) {
    counter!("gateway_retries_total", "service" => service.to_string(), "kind" => kind).increment(1);
}

pub fn record_pool_leased(count: usize) {
    gauge!("gateway_pool_leased_connections").set(count as f64);
}

pub fn record_pool_idle(count: usize) {
    gauge!("gateway_pool_idle_connections").set(count as f64);
}

pub fn record_endpoint_health(endpoint: &str, healthy: bool) {
    gauge!("gateway_endpoint_health", "endpoint" => endpoint.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_circuit_state(endpoint: &str, state: CircuitState) {
    gauge!("gateway_circuit_state", "endpoint" => endpoint.to_string()).set(state.as_gauge());
}

pub fn record_dedup_join() {
    counter!("gateway_dedup_joins_total").increment(1);
}

pub fn record_cancellation() {
    counter!("gateway_cancellations_total").increment(1);
}
