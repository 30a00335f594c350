//! Periodic descriptor refresh and load reporting.
//!
//! Every heartbeat interval this server re-registers its descriptor with a
//! fresh TTL, publishes its live connection count, and refreshes every
//! locally-owned tunnel so a live tunnel's record never outlives its TTL.
//! The active-tunnel and active-server gauges are updated from the same
//! snapshot.

use std::sync::Arc;

use crate::observability::metrics;
use crate::registry::{Registry, ServerRecord, HEARTBEAT_INTERVAL};
use crate::server::connections::ConnectionManager;

/// Spawn the heartbeat loop; it exits when `shutdown` resolves.
pub fn spawn_heartbeat(
    registry: Arc<dyn Registry>,
    conn_mgr: Arc<ConnectionManager>,
    descriptor: ServerRecord,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => beat(&registry, &conn_mgr, &descriptor).await,
                _ = shutdown.recv() => return,
            }
        }
    })
}

async fn beat(
    registry: &Arc<dyn Registry>,
    conn_mgr: &Arc<ConnectionManager>,
    descriptor: &ServerRecord,
) {
    let active_connections = conn_mgr.active_connections();
    let sub_domains = conn_mgr.list_sub_domains();

    let mut record = descriptor.clone();
    record.active_tunnels = sub_domains.len();
    record.active_connections = active_connections;
    if let Err(e) = registry.register_server(record).await {
        tracing::warn!(error = %e, "Failed to refresh server descriptor");
    }
    if let Err(e) = registry.update_server_load(active_connections).await {
        tracing::warn!(error = %e, "Failed to update server load");
    }

    // Keep locally-owned tunnel records alive; the TTL strictly exceeds
    // this interval, so a live tunnel never lapses.
    for sub_domain in sub_domains {
        if let Err(e) = registry.refresh_tunnel(&sub_domain).await {
            tracing::warn!(subdomain = %sub_domain, error = %e, "Failed to refresh tunnel");
        }
    }

    match registry.list_tunnels().await {
        Ok(tunnels) => metrics::set_tunnels_active(tunnels.len()),
        Err(e) => tracing::debug!(error = %e, "Failed to snapshot tunnels for metrics"),
    }
    match registry.list_servers().await {
        Ok(servers) => metrics::set_servers_active(servers.len()),
        Err(e) => tracing::debug!(error = %e, "Failed to snapshot servers for metrics"),
    }
}
