//! Redis-backed registry for multi-server clusters.
//!
//! Records are serialized to JSON and stored under prefixed keys with a
//! per-key TTL equal to the tunnel or server TTL, so a dead owner's entries
//! disappear without any coordination. A pub/sub channel carries short
//! `"{action}:{subdomain}"` invalidations that keep every server's local
//! lookup cache honest between TTL expiries.
//!
//! Enumeration uses cursor-based SCAN rather than KEYS so listing tunnels
//! never stalls the store.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::scan::Scanner;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::registry::cache::{TunnelCache, JANITOR_INTERVAL};
use crate::registry::{
    unix_now, CacheStats, Registry, RegistryError, ServerRecord, TunnelRecord, CACHE_TTL,
    HEARTBEAT_INTERVAL, SERVER_TTL, TUNNEL_TTL,
};

const TUNNEL_PREFIX: &str = "tunnel:";
const SERVER_PREFIX: &str = "server:";
const UPDATE_CHANNEL: &str = "tunnel:updates";
const SCAN_PAGE: u32 = 100;

impl From<fred::error::Error> for RegistryError {
    fn from(e: fred::error::Error) -> Self {
        RegistryError::Unavailable(e.to_string())
    }
}

/// Registry variant backed by a shared Redis store.
pub struct DistributedRegistry {
    client: Client,
    subscriber: Client,
    server_id: String,
    cache: Arc<TunnelCache>,
    shutdown: CancellationToken,
}

impl DistributedRegistry {
    /// Connect both the command client and the invalidation subscriber,
    /// then start the pub/sub listener and the cache janitor.
    pub async fn connect(redis_url: &str, server_id: &str) -> Result<Self, RegistryError> {
        let config = Config::from_url(redis_url)?;

        let client = Builder::from_config(config.clone()).build()?;
        let _ = client.init().await?;

        // Dedicated connection for pub/sub: a subscribed connection cannot
        // also serve regular commands.
        let subscriber = Builder::from_config(config).build()?;
        let _ = subscriber.init().await?;
        subscriber.subscribe(UPDATE_CHANNEL).await?;

        tracing::info!(server_id = %server_id, "Connected to Redis");

        let cache = Arc::new(TunnelCache::new(CACHE_TTL));
        let shutdown = CancellationToken::new();

        tokio::spawn(listen_for_updates(
            subscriber.message_rx(),
            Arc::clone(&cache),
            shutdown.clone(),
        ));
        tokio::spawn(run_janitor(Arc::clone(&cache), shutdown.clone()));

        Ok(Self {
            client,
            subscriber,
            server_id: server_id.to_string(),
            cache,
            shutdown,
        })
    }

    async fn fetch_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, RegistryError> {
        let key = format!("{}{}", TUNNEL_PREFIX, subdomain);

        let started = Instant::now();
        let data: Option<String> = self.client.get(&key).await.inspect_err(|_| {
            metrics::record_registry_op("get_tunnel", "error");
        })?;
        metrics::record_registry_latency(started);

        let Some(data) = data else {
            metrics::record_registry_op("get_tunnel", "not_found");
            return Err(RegistryError::NotFound);
        };
        metrics::record_registry_op("get_tunnel", "success");

        serde_json::from_str(&data).map_err(RegistryError::Codec)
    }

    async fn publish_update(&self, action: &str, subdomain: &str) {
        let payload = format!("{}:{}", action, subdomain);
        let result: Result<i64, fred::error::Error> =
            self.client.publish(UPDATE_CHANNEL, payload).await;
        if let Err(e) = result {
            tracing::warn!(subdomain = %subdomain, error = %e, "Failed to publish update");
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, RegistryError> {
        let mut scanner = self.client.scan(pattern, Some(SCAN_PAGE), None);
        let mut keys = Vec::new();
        while let Some(page) = scanner.next().await {
            let mut page = page?;
            if let Some(page_keys) = page.take_results() {
                keys.extend(page_keys.into_iter().filter_map(|key| key.into_string()));
            }
            let _ = page.next();
        }
        Ok(keys)
    }

    async fn store_server(&self, record: &ServerRecord) -> Result<(), RegistryError> {
        let data = serde_json::to_string(record).map_err(RegistryError::Codec)?;
        let key = format!("{}{}", SERVER_PREFIX, record.server_id);

        let started = Instant::now();
        let result: Result<(), fred::error::Error> = self
            .client
            .set(
                &key,
                data,
                Some(Expiration::EX(SERVER_TTL.as_secs() as i64)),
                None,
                false,
            )
            .await;
        metrics::record_registry_latency(started);

        match result {
            Ok(()) => {
                metrics::record_registry_op("register_server", "success");
                Ok(())
            }
            Err(e) => {
                metrics::record_registry_op("register_server", "error");
                Err(e.into())
            }
        }
    }
}

async fn listen_for_updates(
    mut rx: tokio::sync::broadcast::Receiver<fred::types::Message>,
    cache: Arc<TunnelCache>,
    shutdown: CancellationToken,
) {
    tracing::info!("Started pub/sub listener for cache invalidation");
    loop {
        tokio::select! {
            message = rx.recv() => {
                let message = match message {
                    Ok(message) => message,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Pub/sub listener lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                metrics::record_pubsub_message();

                let Some(payload) = message.value.as_string() else { continue };
                if let Some((action, subdomain)) = payload.split_once(':') {
                    cache.invalidate(subdomain);
                    tracing::debug!(
                        subdomain = %subdomain,
                        action = %action,
                        "Cache invalidated via pub/sub"
                    );
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn run_janitor(cache: Arc<TunnelCache>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => cache.purge_expired(),
            _ = shutdown.cancelled() => return,
        }
    }
}

#[async_trait]
impl Registry for DistributedRegistry {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn register_tunnel(&self, mut record: TunnelRecord) -> Result<(), RegistryError> {
        record.server_id = self.server_id.clone();
        record.last_seen_at = unix_now();
        if record.created_at == 0 {
            record.created_at = record.last_seen_at;
        }

        let data = serde_json::to_string(&record).map_err(RegistryError::Codec)?;
        let key = format!("{}{}", TUNNEL_PREFIX, record.subdomain);

        let started = Instant::now();
        let result: Result<(), fred::error::Error> = self
            .client
            .set(
                &key,
                data,
                Some(Expiration::EX(TUNNEL_TTL.as_secs() as i64)),
                None,
                false,
            )
            .await;
        metrics::record_registry_latency(started);

        if let Err(e) = result {
            metrics::record_registry_op("register_tunnel", "error");
            return Err(e.into());
        }
        metrics::record_registry_op("register_tunnel", "success");

        self.cache.invalidate(&record.subdomain);
        self.publish_update("register", &record.subdomain).await;

        tracing::info!(
            subdomain = %record.subdomain,
            server_id = %record.server_id,
            client_id = %record.client_id,
            "Tunnel registered"
        );
        Ok(())
    }

    async fn get_tunnel(&self, subdomain: &str) -> Result<TunnelRecord, RegistryError> {
        if let Some(cached) = self.cache.get(subdomain) {
            return Ok(cached);
        }

        let record = self.fetch_tunnel(subdomain).await?;
        if record.is_expired(unix_now()) {
            return Err(RegistryError::Expired);
        }

        self.cache.insert(record.clone());
        Ok(record)
    }

    async fn unregister_tunnel(&self, subdomain: &str) -> Result<(), RegistryError> {
        let key = format!("{}{}", TUNNEL_PREFIX, subdomain);

        let started = Instant::now();
        let result: Result<u64, fred::error::Error> = self.client.del(&key).await;
        metrics::record_registry_latency(started);

        if let Err(e) = result {
            metrics::record_registry_op("unregister_tunnel", "error");
            return Err(e.into());
        }
        metrics::record_registry_op("unregister_tunnel", "success");

        self.cache.invalidate(subdomain);
        self.publish_update("unregister", subdomain).await;

        tracing::info!(subdomain = %subdomain, server_id = %self.server_id, "Tunnel unregistered");
        Ok(())
    }

    async fn refresh_tunnel(&self, subdomain: &str) -> Result<(), RegistryError> {
        // Rewrites the whole record so the key gets a fresh TTL.
        let record = self.fetch_tunnel(subdomain).await?;
        self.register_tunnel(record).await
    }

    async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, RegistryError> {
        let keys = self.scan_keys(&format!("{}*", TUNNEL_PREFIX)).await?;
        let now = unix_now();

        let mut tunnels = Vec::with_capacity(keys.len());
        for key in keys {
            // Keys may expire between SCAN and GET.
            let data: Option<String> = match self.client.get(&key).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            let Some(data) = data else { continue };
            match serde_json::from_str::<TunnelRecord>(&data) {
                Ok(record) if !record.is_expired(now) => tunnels.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to decode tunnel record"),
            }
        }
        Ok(tunnels)
    }

    async fn is_local(&self, subdomain: &str) -> Result<bool, RegistryError> {
        let record = self.get_tunnel(subdomain).await?;
        Ok(record.server_id == self.server_id)
    }

    async fn register_server(&self, mut record: ServerRecord) -> Result<(), RegistryError> {
        record.server_id = self.server_id.clone();
        record.last_heartbeat = unix_now();
        self.store_server(&record).await
    }

    async fn get_server(&self, server_id: &str) -> Result<ServerRecord, RegistryError> {
        let key = format!("{}{}", SERVER_PREFIX, server_id);
        let data: Option<String> = self.client.get(&key).await?;
        let Some(data) = data else {
            return Err(RegistryError::NotFound);
        };
        serde_json::from_str(&data).map_err(RegistryError::Codec)
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        let keys = self.scan_keys(&format!("{}*", SERVER_PREFIX)).await?;

        let mut servers = Vec::with_capacity(keys.len());
        for key in keys {
            let data: Option<String> = match self.client.get(&key).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            let Some(data) = data else { continue };
            match serde_json::from_str::<ServerRecord>(&data) {
                Ok(record) => servers.push(record),
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to decode server record"),
            }
        }
        Ok(servers)
    }

    fn start_heartbeat(&self, record: ServerRecord) {
        let client = self.client.clone();
        let server_id = self.server_id.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut record = record.clone();
                        record.last_heartbeat = unix_now();
                        let data = match serde_json::to_string(&record) {
                            Ok(data) => data,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to encode heartbeat record");
                                continue;
                            }
                        };
                        let key = format!("{}{}", SERVER_PREFIX, server_id);
                        let result: Result<(), fred::error::Error> = client
                            .set(
                                &key,
                                data,
                                Some(Expiration::EX(SERVER_TTL.as_secs() as i64)),
                                None,
                                false,
                            )
                            .await;
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Failed to send heartbeat");
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
        tracing::info!(interval_secs = HEARTBEAT_INTERVAL.as_secs(), "Started heartbeat");
    }

    async fn pick_least_loaded_server(&self) -> Result<ServerRecord, RegistryError> {
        let servers = self.list_servers().await?;
        servers
            .into_iter()
            .min_by(|a, b| {
                a.active_connections
                    .cmp(&b.active_connections)
                    .then_with(|| a.server_id.cmp(&b.server_id))
            })
            .ok_or(RegistryError::NoServers)
    }

    async fn update_server_load(&self, active_connections: usize) -> Result<(), RegistryError> {
        let mut record = self.get_server(&self.server_id).await?;
        record.active_connections = active_connections;
        self.store_server(&record).await
    }

    fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn close(&self) {
        self.shutdown.cancel();

        // Drop this server's descriptor so peers stop routing to it.
        let key = format!("{}{}", SERVER_PREFIX, self.server_id);
        let result: Result<u64, fred::error::Error> = self.client.del(&key).await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to unregister server");
        }

        let _ = self.subscriber.quit().await;
        let _ = self.client.quit().await;
    }
}
