//! Cluster-visible directory of tunnels and servers.
//!
//! # Responsibilities
//! - Define the registry contract shared by both variants
//! - Define the tunnel and server record shapes stored in the directory
//! - Select a variant from configuration (empty Redis URL selects in-memory)
//!
//! # Design Decisions
//! - Tunnel state is ephemeral: records live only as long as a control
//!   connection refreshes them within the TTL
//! - `Unavailable` errors are survivable; callers fall back to local-only
//!   routing until the shared store recovers

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod distributed;
pub mod memory;

pub use distributed::DistributedRegistry;
pub use memory::InMemoryRegistry;

/// Tunnels expire if not refreshed within this window.
pub const TUNNEL_TTL: Duration = Duration::from_secs(30);

/// Servers expire if their heartbeat stops for this long.
pub const SERVER_TTL: Duration = Duration::from_secs(10);

/// How often servers refresh their descriptor and their tunnels.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Lifetime of a local tunnel-lookup cache entry.
pub const CACHE_TTL: Duration = Duration::from_secs(2);

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A tunnel record as serialized for the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub subdomain: String,
    pub server_id: String,
    /// Address peers use to reach the owning server's proxy port.
    pub server_host: String,
    pub client_id: String,
    /// Unix seconds; zero means "not yet created".
    pub created_at: u64,
    /// Unix seconds of the last refresh.
    pub last_seen_at: u64,
    pub proxy_port: u16,
    pub control_port: u16,
    /// Hex sha256 of the tunnel password, when the tunnel is protected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

impl TunnelRecord {
    /// Whether the record's last refresh is older than the tunnel TTL.
    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_seen_at) > TUNNEL_TTL.as_secs()
    }
}

/// A server descriptor as serialized for the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: String,
    pub host: String,
    pub proxy_port: u16,
    pub control_port: u16,
    /// Unix seconds of the last heartbeat.
    pub last_heartbeat: u64,
    pub active_tunnels: usize,
    /// Live control connections, for load-aware placement.
    pub active_connections: usize,
}

/// Cache hit/miss counters exposed for introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate in percent; zero when no lookups happened.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64 * 100.0
    }
}

/// Error type for registry operations.
#[derive(Debug)]
pub enum RegistryError {
    /// No record for the requested key.
    NotFound,
    /// A record exists but its last refresh is older than the TTL.
    Expired,
    /// The cluster has no live servers.
    NoServers,
    /// The shared store could not be reached; transient.
    Unavailable(String),
    /// A stored record could not be (de)serialized.
    Codec(serde_json::Error),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound => write!(f, "record not found"),
            RegistryError::Expired => write!(f, "record expired"),
            RegistryError::NoServers => write!(f, "no servers available"),
            RegistryError::Unavailable(e) => write!(f, "registry unavailable: {}", e),
            RegistryError::Codec(e) => write!(f, "record codec error: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The registry contract implemented by both variants.
///
/// All operations are safe to call concurrently. None of them holds internal
/// locks across store I/O.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Id of the server owning this registry handle.
    fn server_id(&self) -> &str;

    /// Idempotent upsert keyed by subdomain. Sets `server_id` to this server
    /// and `last_seen_at` to now; preserves a non-zero `created_at`.
    async fn register_tunnel(&self, record: TunnelRecord) -> Result<(), RegistryError>;

    /// Look up a tunnel. Returns [`RegistryError::Expired`] when the record
    /// outlived [`TUNNEL_TTL`].
    async fn get_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, RegistryError>;

    /// Delete a tunnel. Deleting an absent tunnel is not an error.
    async fn unregister_tunnel(&self, subdomain: &str) -> Result<(), RegistryError>;

    /// Bump `last_seen_at` to now. Returns [`RegistryError::NotFound`] when
    /// absent.
    async fn refresh_tunnel(&self, subdomain: &str) -> Result<(), RegistryError>;

    /// Snapshot of all non-expired tunnels.
    async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, RegistryError>;

    /// Whether the tunnel is owned by this server.
    async fn is_local(&self, subdomain: &str) -> Result<bool, RegistryError>;

    /// Upsert this server's descriptor with a fresh TTL.
    async fn register_server(&self, record: ServerRecord) -> Result<(), RegistryError>;

    /// Look up a server descriptor by id.
    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, RegistryError>;

    /// Snapshot of all live servers.
    async fn list_servers(&self) -> Result<Vec<ServerRecord>, RegistryError>;

    /// Spawn the periodic descriptor refresh for this server.
    fn start_heartbeat(&self, record: ServerRecord);

    /// The live server with the fewest active connections; ties broken by
    /// server id, so the pick is deterministic within one process.
    async fn pick_least_loaded_server(&self) -> Result<ServerRecord, RegistryError>;

    /// Update this server's `active_connections` count.
    async fn update_server_load(&self, active_connections: usize) -> Result<(), RegistryError>;

    /// Lookup-cache counters. The in-memory variant counts map lookups.
    fn cache_stats(&self) -> CacheStats;

    /// Release store connections and stop background tasks.
    async fn close(&self);
}

/// Create a registry from configuration: an empty `redis_url` selects the
/// in-memory variant, anything else the distributed one.
pub async fn connect(redis_url: &str, server_id: &str) -> Result<Arc<dyn Registry>, RegistryError> {
    if redis_url.is_empty() {
        tracing::info!(server_id = %server_id, "Using in-memory registry (non-distributed mode)");
        Ok(Arc::new(InMemoryRegistry::new(server_id)))
    } else {
        tracing::info!(server_id = %server_id, "Using Redis registry (distributed mode)");
        let registry = DistributedRegistry::connect(redis_url, server_id).await?;
        Ok(Arc::new(registry))
    }
}
