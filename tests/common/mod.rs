//! Shared utilities for integration testing: mock origins, a server
//! harness, and a driveable tunnel client.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tungo::client::TunnelClient;
use tungo::config::{ClientConfig, ServerConfig, ServerNode};
use tungo::lifecycle::Shutdown;
use tungo::registry;
use tungo::TunnelServer;

/// Start a mock HTTP origin that answers every request with a fixed body
/// and closes the socket.
pub async fn start_mock_origin(port: u16, body: &'static str) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
}

/// Start a mock origin that writes its whole response in a short burst and
/// then holds the socket open without closing it.
#[allow(dead_code)]
pub async fn start_burst_origin(port: u16, body_len: usize) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
                    body_len
                );
                let _ = socket.write_all(head.as_bytes()).await;

                // The body goes out in a handful of chunks over ~80 ms.
                let chunk = vec![b'x'; body_len / 4];
                for _ in 0..4 {
                    let _ = socket.write_all(&chunk).await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }

                // Hold the socket open; end-of-response must be inferred.
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
}

/// A tunnel server running against an in-memory registry.
pub struct TestServer {
    pub config: Arc<ServerConfig>,
    pub shutdown: Shutdown,
}

impl TestServer {
    /// Start a server on the given ports with the default
    /// `{{ .subdomain }}.localhost` domain template and an in-memory
    /// registry.
    pub async fn start(id: &str, proxy_port: u16, control_port: u16) -> Self {
        Self::start_with_registry(id, proxy_port, control_port, "").await
    }

    /// Start a server against a shared Redis registry.
    #[allow(dead_code)]
    pub async fn start_distributed(
        id: &str,
        proxy_port: u16,
        control_port: u16,
        redis_url: &str,
    ) -> Self {
        Self::start_with_registry(id, proxy_port, control_port, redis_url).await
    }

    async fn start_with_registry(
        id: &str,
        proxy_port: u16,
        control_port: u16,
        redis_url: &str,
    ) -> Self {
        let config = Arc::new(ServerConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: proxy_port,
            control_port,
            redis_url: redis_url.to_string(),
            ..ServerConfig::default()
        });

        let reg = registry::connect(redis_url, id).await.unwrap();
        let descriptor = tungo::registry::ServerRecord {
            server_id: id.to_string(),
            host: "127.0.0.1".to_string(),
            proxy_port,
            control_port,
            last_heartbeat: 0,
            active_tunnels: 0,
            active_connections: 0,
        };
        reg.register_server(descriptor).await.unwrap();

        let server = TunnelServer::new(Arc::clone(&config), reg);
        let shutdown = Shutdown::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = server.run(shutdown).await;
            });
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        Self { config, shutdown }
    }
}

/// A connected tunnel client being served in a background task.
pub struct TestClient {
    pub sub_domain: String,
    pub shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<TunnelClient>,
}

impl TestClient {
    /// Connect to the server and start serving streams.
    pub async fn connect(
        control_port: u16,
        local_port: u16,
        subdomain: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let config = ClientConfig {
            server_cluster: vec![ServerNode {
                host: "127.0.0.1".to_string(),
                port: control_port,
                secure: false,
            }],
            local_host: "127.0.0.1".to_string(),
            local_port,
            subdomain: subdomain.unwrap_or_default().to_string(),
            password: password.unwrap_or_default().to_string(),
            ..ClientConfig::default()
        };

        let mut client = TunnelClient::new(config);
        let ws = client.connect().await.expect("client failed to connect");
        let sub_domain = client
            .server_info()
            .and_then(|info| info.sub_domain.clone())
            .expect("server hello carried no subdomain");

        let shutdown = CancellationToken::new();
        let session_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            client.serve(ws, &session_shutdown).await;
            client
        });

        Self {
            sub_domain,
            shutdown,
            handle,
        }
    }

    /// Tear the session down and hand the engine back, remembered
    /// subdomain included.
    pub async fn disconnect(self) -> TunnelClient {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

/// A reqwest client that resolves the tunnel hostname to the local proxy.
pub fn public_client(hostname: &str, proxy_port: u16) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(
            hostname,
            std::net::SocketAddr::from(([127, 0, 0, 1], proxy_port)),
        )
        .no_proxy()
        .build()
        .unwrap()
}
