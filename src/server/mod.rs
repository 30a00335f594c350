//! Server side: control plane, public proxy, and their shared state.

pub mod connections;
pub mod control;
pub mod heartbeat;
pub mod pages;
pub mod peer;
pub mod router;

pub use connections::{ClientConnection, ConnectionManager, Stream};
pub use control::ControlState;
pub use peer::PeerProxy;
pub use router::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::lifecycle::Shutdown;
use crate::registry::Registry;

/// The assembled tunnel server: public proxy listener plus control
/// listener, sharing one connection manager and registry handle.
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    registry: Arc<dyn Registry>,
    conn_mgr: Arc<ConnectionManager>,
}

impl TunnelServer {
    pub fn new(config: Arc<ServerConfig>, registry: Arc<dyn Registry>) -> Self {
        let conn_mgr = Arc::new(ConnectionManager::new(config.max_connections));
        Self {
            config,
            registry,
            conn_mgr,
        }
    }

    pub fn connection_manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.conn_mgr)
    }

    fn build_public_router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            conn_mgr: Arc::clone(&self.conn_mgr),
            peer: Arc::new(PeerProxy::new()),
        };
        Router::new()
            .route("/", any(router::proxy_handler))
            .route("/{*path}", any(router::proxy_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    fn build_control_router(&self) -> Router {
        let state = ControlState {
            config: Arc::clone(&self.config),
            conn_mgr: Arc::clone(&self.conn_mgr),
            registry: Arc::clone(&self.registry),
        };
        Router::new()
            .route("/ws", any(control::ws_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind both listeners and serve until shutdown. Listeners stop
    /// accepting first; live control connections are revoked once both have
    /// drained.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let public_addr = format!("{}:{}", self.config.host, self.config.port);
        let control_addr = format!("{}:{}", self.config.host, self.config.control_port);

        let public_listener = tokio::net::TcpListener::bind(&public_addr).await?;
        let control_listener = tokio::net::TcpListener::bind(&control_addr).await?;

        tracing::info!(addr = %public_addr, "Proxy server listening");
        tracing::info!(addr = %control_addr, "Control server listening");

        let public = axum::serve(
            public_listener,
            self.build_public_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.wait());

        let control = axum::serve(
            control_listener,
            self.build_control_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.wait());

        // On the shutdown signal the listeners stop accepting; revoking the
        // connections right after lets the long-lived control sockets drain
        // so graceful shutdown can complete.
        let reaper = {
            let conn_mgr = Arc::clone(&self.conn_mgr);
            let wait = shutdown.wait();
            tokio::spawn(async move {
                wait.await;
                conn_mgr.revoke_all();
            })
        };

        let (public_result, control_result) =
            tokio::join!(async { public.await }, async { control.await });
        public_result?;
        control_result?;

        reaper.abort();
        self.conn_mgr.revoke_all();
        tracing::info!("Tunnel server stopped");
        Ok(())
    }
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<ControlState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.conn_mgr.active_connections(),
        "subdomains": state.conn_mgr.list_sub_domains(),
    }))
}
