//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the tunnel
//! server and client. All types derive Serde traits for deserialization from
//! config files; every field can also be overridden by environment variables
//! (see the loader).

use serde::{Deserialize, Serialize};

/// Root configuration for a tunnel server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Cluster-unique server identifier.
    pub id: String,

    /// Bind host for all listeners, and the address peers use to reach this
    /// server's proxy port.
    pub host: String,

    /// Public HTTP proxy port.
    pub port: u16,

    /// Control (WebSocket) port.
    pub control_port: u16,

    /// Prometheus metrics port.
    pub metrics_port: u16,

    /// Maximum concurrent control connections.
    pub max_connections: usize,

    /// Require authenticated hellos (secret key).
    pub require_auth: bool,

    /// Accept anonymous hellos.
    pub allow_anonymous: bool,

    /// Public hostname template containing the `{{ .subdomain }}` placeholder,
    /// e.g. `"{{ .subdomain }}.localhost"`.
    pub domain: String,

    /// Public URL template over `{{ .domain }}` and `{{ .port }}`,
    /// e.g. `"http://{{ .domain }}:{{ .port }}"`.
    pub public_url: String,

    /// HTTP read timeout in seconds.
    pub read_timeout_secs: u64,

    /// HTTP write timeout in seconds.
    pub write_timeout_secs: u64,

    /// HTTP idle timeout in seconds.
    pub idle_timeout_secs: u64,

    /// Redis URL for the distributed registry. Empty selects the in-memory
    /// variant.
    pub redis_url: String,

    /// Log level: debug, info, warn, error.
    pub log_level: String,

    /// Log format: json or console.
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: "server-1".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            control_port: 5000,
            metrics_port: 9090,
            max_connections: 1000,
            require_auth: false,
            allow_anonymous: true,
            domain: "{{ .subdomain }}.localhost".to_string(),
            public_url: "http://{{ .domain }}:{{ .port }}".to_string(),
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 120,
            redis_url: String::new(),
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

/// A single server reachable by a client, for failover rotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerNode {
    /// Server hostname.
    pub host: String,

    /// Control port.
    pub port: u16,

    /// Use wss:// instead of ws://.
    #[serde(default)]
    pub secure: bool,
}

/// Root configuration for a tunnel client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Full server URL (e.g. `wss://tunnel.example.com:5000`). Takes
    /// precedence over `server_host`/`control_port` and `server_cluster`.
    pub server_url: String,

    /// Primary server host (single-server setup).
    pub server_host: String,

    /// Primary server control port (single-server setup).
    pub control_port: u16,

    /// Cluster members for failover. When non-empty, used instead of the
    /// single-server fields.
    pub server_cluster: Vec<ServerNode>,

    /// Local origin host.
    pub local_host: String,

    /// Local origin port.
    pub local_port: u16,

    /// Requested subdomain; empty lets the server assign one.
    pub subdomain: String,

    /// Secret key for authenticated mode; empty selects anonymous mode.
    pub secret_key: String,

    /// Password protecting public access to the tunnel.
    pub password: String,

    /// Reconnect token from a previous session.
    pub reconnect_token: String,

    /// Hello exchange timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Delay between reconnect attempts in seconds.
    pub retry_interval_secs: u64,

    /// Consecutive failures on one cluster member before rotating to the
    /// next.
    pub max_retries: u32,

    /// Skip TLS certificate verification (testing only).
    pub insecure_tls: bool,

    /// Capture request/response bytes per stream for inspection.
    pub capture_traffic: bool,

    /// Log level: debug, info, warn, error.
    pub log_level: String,

    /// Log format: json or console.
    pub log_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            server_host: "localhost".to_string(),
            control_port: 5000,
            server_cluster: Vec::new(),
            local_host: "localhost".to_string(),
            local_port: 8000,
            subdomain: String::new(),
            secret_key: String::new(),
            password: String::new(),
            reconnect_token: String::new(),
            connect_timeout_secs: 10,
            retry_interval_secs: 5,
            max_retries: 5,
            insecure_tls: false,
            capture_traffic: false,
            log_level: "info".to_string(),
            log_format: "console".to_string(),
        }
    }
}

impl ClientConfig {
    /// Resolve the ordered list of servers to try: `server_url` if set, then
    /// the cluster, then the single-server fields.
    pub fn server_list(&self) -> Vec<ServerNode> {
        if !self.server_url.is_empty() {
            if let Ok(node) = parse_server_url(&self.server_url) {
                return vec![node];
            }
        }
        if !self.server_cluster.is_empty() {
            return self.server_cluster.clone();
        }
        vec![ServerNode {
            host: self.server_host.clone(),
            port: self.control_port,
            secure: false,
        }]
    }
}

/// Parse a server URL into a [`ServerNode`].
///
/// Accepts `http(s)://` and `ws(s)://` schemes; a bare host defaults to
/// `https`. Default ports follow the scheme (443 secure, 80 plain).
pub fn parse_server_url(server_url: &str) -> Result<ServerNode, url::ParseError> {
    let with_scheme = if server_url.contains("://") {
        server_url.to_string()
    } else {
        format!("https://{}", server_url)
    };

    let parsed = url::Url::parse(&with_scheme)?;
    let secure = matches!(parsed.scheme(), "https" | "wss");
    let host = parsed.host_str().ok_or(url::ParseError::EmptyHost)?.to_string();
    let port = parsed.port().unwrap_or(if secure { 443 } else { 80 });

    Ok(ServerNode { host, port, secure })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_url_variants() {
        let node = parse_server_url("wss://tunnel.example.com").unwrap();
        assert_eq!(node.host, "tunnel.example.com");
        assert_eq!(node.port, 443);
        assert!(node.secure);

        let node = parse_server_url("ws://localhost:5555").unwrap();
        assert_eq!(node.port, 5555);
        assert!(!node.secure);

        let node = parse_server_url("tunnel.example.com").unwrap();
        assert!(node.secure);
        assert_eq!(node.port, 443);

        let node = parse_server_url("http://10.0.0.1:8080").unwrap();
        assert_eq!(node.host, "10.0.0.1");
        assert_eq!(node.port, 8080);
        assert!(!node.secure);
    }

    #[test]
    fn server_list_precedence() {
        let mut config = ClientConfig::default();
        config.server_cluster = vec![
            ServerNode { host: "a".into(), port: 5000, secure: false },
            ServerNode { host: "b".into(), port: 5000, secure: false },
        ];
        assert_eq!(config.server_list().len(), 2);

        config.server_url = "ws://c:5001".into();
        let list = config.server_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].host, "c");

        let config = ClientConfig::default();
        let list = config.server_list();
        assert_eq!(list[0].host, "localhost");
        assert_eq!(list[0].port, 5000);
    }
}
