//! Metrics collection and exposition.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize the Prometheus exporter and its HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}/metrics", addr);
}

/// Record the outcome of one shared-store operation.
pub fn record_registry_op(operation: &'static str, status: &'static str) {
    counter!("tungo_redis_operations_total", "operation" => operation, "status" => status)
        .increment(1);
}

/// Record the latency of one shared-store round trip.
pub fn record_registry_latency(started: Instant) {
    histogram!("tungo_redis_latency_seconds").record(started.elapsed().as_secs_f64());
}

/// Record a tunnel-lookup cache hit.
pub fn record_cache_hit() {
    counter!("tungo_cache_hits_total").increment(1);
}

/// Record a tunnel-lookup cache miss.
pub fn record_cache_miss() {
    counter!("tungo_cache_misses_total").increment(1);
}

/// Record one received pub/sub invalidation.
pub fn record_pubsub_message() {
    counter!("tungo_pubsub_messages_total").increment(1);
}

/// Update the active-tunnel gauge.
pub fn set_tunnels_active(count: usize) {
    gauge!("tungo_tunnels_active").set(count as f64);
}

/// Update the active-server gauge.
pub fn set_servers_active(count: usize) {
    gauge!("tungo_servers_active").set(count as f64);
}

/// Record one cross-server proxied request and its latency.
pub fn record_proxy_request(status: &'static str, started: Instant) {
    counter!("tungo_proxy_requests_total", "status" => status).increment(1);
    histogram!("tungo_proxy_latency_seconds").record(started.elapsed().as_secs_f64());
}
