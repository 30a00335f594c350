//! In-memory registry for single-server deployments.
//!
//! Two maps under independent read-write locks plus a background sweeper
//! that evicts tunnels whose last refresh exceeded the TTL. Single-node
//! deployments pay no distributed-systems cost: lookups are map reads and
//! the "least loaded server" is always this one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::registry::{
    unix_now, CacheStats, Registry, RegistryError, ServerRecord, TunnelRecord, HEARTBEAT_INTERVAL,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct MemoryState {
    tunnels: RwLock<HashMap<String, TunnelRecord>>,
    servers: RwLock<HashMap<String, ServerRecord>>,
    lookups: AtomicU64,
    hits: AtomicU64,
}

/// Registry variant backed entirely by process-local maps.
pub struct InMemoryRegistry {
    server_id: String,
    state: Arc<MemoryState>,
    shutdown: CancellationToken,
}

impl InMemoryRegistry {
    /// Create the registry and start its expiry sweeper.
    pub fn new(server_id: &str) -> Self {
        let state = Arc::new(MemoryState {
            tunnels: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(sweep_expired(Arc::clone(&state), shutdown.clone()));

        Self {
            server_id: server_id.to_string(),
            state,
            shutdown,
        }
    }

    fn tunnels(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, TunnelRecord>> {
        self.state.tunnels.read().unwrap_or_else(|e| e.into_inner())
    }

    fn tunnels_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, TunnelRecord>> {
        self.state.tunnels.write().unwrap_or_else(|e| e.into_inner())
    }

    fn servers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServerRecord>> {
        self.state.servers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn servers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServerRecord>> {
        self.state.servers.write().unwrap_or_else(|e| e.into_inner())
    }
}

async fn sweep_expired(state: Arc<MemoryState>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = unix_now();
                let mut tunnels = state.tunnels.write().unwrap_or_else(|e| e.into_inner());
                tunnels.retain(|subdomain, record| {
                    let keep = !record.is_expired(now);
                    if !keep {
                        tracing::info!(subdomain = %subdomain, "Tunnel expired and removed");
                    }
                    keep
                });
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn register_tunnel(&self, mut record: TunnelRecord) -> Result<(), RegistryError> {
        record.server_id = self.server_id.clone();
        record.last_seen_at = unix_now();
        if record.created_at == 0 {
            record.created_at = record.last_seen_at;
        }

        let subdomain = record.subdomain.clone();
        let client_id = record.client_id.clone();
        self.tunnels_mut().insert(subdomain.clone(), record);

        tracing::info!(subdomain = %subdomain, client_id = %client_id, "Tunnel registered");
        Ok(())
    }

    async fn get_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, RegistryError> {
        self.state.lookups.fetch_add(1, Ordering::Relaxed);

        let tunnels = self.tunnels();
        let record = tunnels.get(subdomain).ok_or(RegistryError::NotFound)?;
        self.state.hits.fetch_add(1, Ordering::Relaxed);

        if record.is_expired(unix_now()) {
            return Err(RegistryError::Expired);
        }
        Ok(record.clone())
    }

    async fn unregister_tunnel(&self, subdomain: &str) -> Result<(), RegistryError> {
        self.tunnels_mut().remove(subdomain);
        tracing::info!(subdomain = %subdomain, "Tunnel unregistered");
        Ok(())
    }

    async fn refresh_tunnel(&self, subdomain: &str) -> Result<(), RegistryError> {
        let mut tunnels = self.tunnels_mut();
        let record = tunnels.get_mut(subdomain).ok_or(RegistryError::NotFound)?;
        record.last_seen_at = unix_now();
        Ok(())
    }

    async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, RegistryError> {
        let now = unix_now();
        Ok(self
            .tunnels()
            .values()
            .filter(|record| !record.is_expired(now))
            .cloned()
            .collect())
    }

    async fn is_local(&self, subdomain: &str) -> Result<bool, RegistryError> {
        Ok(self.tunnels().contains_key(subdomain))
    }

    async fn register_server(&self, mut record: ServerRecord) -> Result<(), RegistryError> {
        record.last_heartbeat = unix_now();
        self.servers_mut().insert(record.server_id.clone(), record);
        Ok(())
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, RegistryError> {
        self.servers()
            .get(server_id)
            .cloned()
            .ok_or(RegistryError::NotFound)
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        Ok(self.servers().values().cloned().collect())
    }

    fn start_heartbeat(&self, record: ServerRecord) {
        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active_tunnels = state
                            .tunnels
                            .read()
                            .unwrap_or_else(|e| e.into_inner())
                            .len();
                        let mut servers = state.servers.write().unwrap_or_else(|e| e.into_inner());
                        if let Some(server) = servers.get_mut(&record.server_id) {
                            server.last_heartbeat = unix_now();
                            server.active_tunnels = active_tunnels;
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    async fn pick_least_loaded_server(&self) -> Result<ServerRecord, RegistryError> {
        // Single-server deployment: the only candidate is this server.
        self.servers()
            .get(&self.server_id)
            .cloned()
            .ok_or(RegistryError::NoServers)
    }

    async fn update_server_load(&self, active_connections: usize) -> Result<(), RegistryError> {
        let mut servers = self.servers_mut();
        if let Some(server) = servers.get_mut(&self.server_id) {
            server.active_connections = active_connections;
        }
        Ok(())
    }

    fn cache_stats(&self) -> CacheStats {
        let lookups = self.state.lookups.load(Ordering::Relaxed);
        let hits = self.state.hits.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses: lookups.saturating_sub(hits),
        }
    }

    async fn close(&self) {
        self.shutdown.cancel();
        tracing::info!("In-memory registry closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subdomain: &str) -> TunnelRecord {
        TunnelRecord {
            subdomain: subdomain.into(),
            server_id: String::new(),
            server_host: "127.0.0.1".into(),
            client_id: "client-1".into(),
            created_at: 0,
            last_seen_at: 0,
            proxy_port: 8080,
            control_port: 5000,
            password_hash: None,
        }
    }

    #[tokio::test]
    async fn register_sets_ownership_and_timestamps() {
        let registry = InMemoryRegistry::new("s1");
        registry.register_tunnel(record("demo")).await.unwrap();

        let fetched = registry.get_tunnel("demo").await.unwrap();
        assert_eq!(fetched.server_id, "s1");
        assert!(fetched.created_at > 0);
        assert_eq!(fetched.created_at, fetched.last_seen_at);
        assert!(registry.is_local("demo").await.unwrap());
    }

    #[tokio::test]
    async fn double_register_preserves_created_at() {
        let registry = InMemoryRegistry::new("s1");
        registry.register_tunnel(record("demo")).await.unwrap();
        let first = registry.get_tunnel("demo").await.unwrap();

        let mut again = record("demo");
        again.created_at = first.created_at;
        registry.register_tunnel(again).await.unwrap();

        let second = registry.get_tunnel("demo").await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_seen_at >= first.last_seen_at);
    }

    #[tokio::test]
    async fn expired_tunnel_is_reported_as_expired() {
        let registry = InMemoryRegistry::new("s1");
        registry.register_tunnel(record("demo")).await.unwrap();

        // Age the record past the TTL directly.
        {
            let mut tunnels = registry.tunnels_mut();
            tunnels.get_mut("demo").unwrap().last_seen_at = unix_now() - TUNNEL_TTL_SECS - 1;
        }

        assert!(matches!(
            registry.get_tunnel("demo").await,
            Err(RegistryError::Expired)
        ));
        assert!(registry.list_tunnels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = InMemoryRegistry::new("s1");
        registry.register_tunnel(record("demo")).await.unwrap();
        registry.unregister_tunnel("demo").await.unwrap();
        registry.unregister_tunnel("demo").await.unwrap();

        assert!(matches!(
            registry.get_tunnel("demo").await,
            Err(RegistryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn refresh_requires_presence() {
        let registry = InMemoryRegistry::new("s1");
        assert!(matches!(
            registry.refresh_tunnel("ghost").await,
            Err(RegistryError::NotFound)
        ));

        registry.register_tunnel(record("demo")).await.unwrap();
        registry.refresh_tunnel("demo").await.unwrap();
    }

    #[tokio::test]
    async fn least_loaded_is_this_server() {
        let registry = InMemoryRegistry::new("s1");
        assert!(matches!(
            registry.pick_least_loaded_server().await,
            Err(RegistryError::NoServers)
        ));

        registry
            .register_server(ServerRecord {
                server_id: "s1".into(),
                host: "127.0.0.1".into(),
                proxy_port: 8080,
                control_port: 5000,
                last_heartbeat: 0,
                active_tunnels: 0,
                active_connections: 0,
            })
            .await
            .unwrap();

        let picked = registry.pick_least_loaded_server().await.unwrap();
        assert_eq!(picked.server_id, "s1");

        registry.update_server_load(7).await.unwrap();
        assert_eq!(registry.get_server("s1").await.unwrap().active_connections, 7);
    }

    const TUNNEL_TTL_SECS: u64 = crate::registry::TUNNEL_TTL.as_secs();
}
