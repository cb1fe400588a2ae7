//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_dispatch_total` (counter): dispatch outcomes by server and kind
//! - `gateway_queue_wait_seconds` (histogram): time spent queued
//! - `gateway_downstream_duration_seconds` (histogram): downstream call latency
//! - `gateway_breaker_state` (gauge): 0=closed, 1=half_open, 2=open
//! - `gateway_pool_{active,idle,max_size,utilization}` (gauges)
//! - `gateway_pool_healthy` (gauge): 1=healthy, 0 otherwise
//! - `gateway_queue_depth` (gauge)
//! - `gateway_tenant_effective_rate` (gauge): interpolated window count
//!
//! Gauges are refreshed from [`GatewaySnapshot`] by the dispatcher's
//! snapshot publisher.

use std::net::SocketAddr;
use std::time::Duration;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::dispatch::GatewaySnapshot;
use crate::pool::PoolHealth;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus metrics listening");
    Ok(())
}

pub fn record_dispatch(server: &str, outcome: &'static str) {
    metrics::counter!("gateway_dispatch_total", "server" => server.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_queue_wait(server: &str, waited: Duration) {
    metrics::histogram!("gateway_queue_wait_seconds", "server" => server.to_string()).record(waited.as_secs_f64());
}

pub fn record_downstream(server: &str, took: Duration, success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::histogram!(
        "gateway_downstream_duration_seconds",
        "server" => server.to_string(),
        "result" => result
    )
    .record(took.as_secs_f64());
}

pub fn record_scale(server: &str, direction: &'static str) {
    metrics::counter!("gateway_pool_scale_total", "server" => server.to_string(), "direction" => direction).increment(1);
}

/// Push a snapshot into gauges.
pub fn publish_snapshot(snapshot: &GatewaySnapshot) {
    for server in &snapshot.servers {
        let id = server.id.clone();
        metrics::gauge!("gateway_breaker_state", "server" => id.clone()).set(server.breaker.state.as_gauge());

        let pool = &server.pool;
        metrics::gauge!("gateway_pool_active", "server" => id.clone()).set(pool.active as f64);
        metrics::gauge!("gateway_pool_idle", "server" => id.clone()).set(pool.idle as f64);
        metrics::gauge!("gateway_pool_max_size", "server" => id.clone()).set(pool.max_size as f64);
        metrics::gauge!("gateway_pool_utilization", "server" => id.clone()).set(pool.utilization);
        let healthy = if pool.health == PoolHealth::Healthy { 1.0 } else { 0.0 };
        metrics::gauge!("gateway_pool_healthy", "server" => id.clone()).set(healthy);

        metrics::gauge!("gateway_queue_depth", "server" => id.clone()).set(server.queue.depth as f64);
        metrics::gauge!("gateway_fair_share_tenants", "server" => id).set(server.active_tenants as f64);
    }

    for tenant in &snapshot.tenants {
        metrics::gauge!("gateway_tenant_effective_rate", "tenant" => tenant.tenant.clone()).set(tenant.effective_rate);
        metrics::gauge!("gateway_tenant_allowed_rate", "tenant" => tenant.tenant.clone()).set(tenant.allowed);
    }
}
