//! Control-plane WebSocket server: hello exchange, pumps, dispatch.
//!
//! # Responsibilities
//! - Accept control connections on `/ws` and read exactly one hello
//! - Authenticate the hello and assign or validate the subdomain
//! - Admit the client into the connection manager and the registry
//! - Run the per-connection read and write pumps
//!
//! # Design Decisions
//! - Hellos are bare JSON objects on the wire; everything after is a
//!   `Message` envelope
//! - Registry failures never kill a connection; the tunnel is still served
//!   from the local connection manager until the store recovers
//! - The write pump owns the socket sink; every other task reaches the wire
//!   only through the bounded outbound queue

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::protocol::{
    decode_frame, encode_frame, generate_sub_domain, validate_sub_domain, ClientHello, ClientId,
    ClientType, DataMessage, Message, MessageType, ServerHello, ServerHelloType,
};
use crate::registry::{Registry, TunnelRecord};
use crate::server::connections::{ClientConnection, ConnectionError, ConnectionManager, SendError};
use crate::server::router::{password_sha256_hex, render_domain, render_public_url};

/// Deadline for the client's first frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping period on the write pump.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state of the control listener.
#[derive(Clone)]
pub struct ControlState {
    pub config: Arc<ServerConfig>,
    pub conn_mgr: Arc<ConnectionManager>,
    pub registry: Arc<dyn Registry>,
}

/// `/ws` upgrade handler. Tunnels originate from arbitrary client
/// processes, so no origin restriction is applied.
pub async fn ws_handler(
    State(state): State<ControlState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(state, socket, addr))
}

async fn handle_connection(state: ControlState, mut socket: WebSocket, addr: SocketAddr) {
    tracing::info!(remote_addr = %addr, "New control connection");

    let hello = match read_hello(&mut socket).await {
        Ok(hello) => hello,
        Err(reason) => {
            tracing::error!(remote_addr = %addr, reason = %reason, "Failed to read client hello");
            send_hello(
                &mut socket,
                &ServerHello::rejection(ServerHelloType::Error, reason),
            )
            .await;
            return;
        }
    };

    let (client_id, sub_domain) = match authenticate(&state, &hello) {
        Ok(identity) => identity,
        Err(rejection) => {
            tracing::warn!(
                remote_addr = %addr,
                client_id = %hello.id,
                reason = ?rejection.error,
                "Hello rejected"
            );
            send_hello(&mut socket, &rejection).await;
            return;
        }
    };

    let (connection, send_rx) = match state.conn_mgr.add_client(
        client_id.clone(),
        sub_domain.clone(),
        hello.client_version.clone(),
        hello.password.clone(),
    ) {
        Ok(admitted) => admitted,
        Err(e) => {
            let hello_type = match e {
                ConnectionError::SubdomainInUse => ServerHelloType::SubDomainInUse,
                ConnectionError::LimitReached => ServerHelloType::Error,
            };
            tracing::warn!(client_id = %client_id, error = %e, "Failed to add client");
            send_hello(&mut socket, &ServerHello::rejection(hello_type, e.to_string())).await;
            return;
        }
    };

    // Best effort: the tunnel is served locally even when the shared store
    // is down.
    let record = TunnelRecord {
        subdomain: sub_domain.clone(),
        server_id: state.registry.server_id().to_string(),
        server_host: state.config.host.clone(),
        client_id: client_id.to_string(),
        created_at: 0,
        last_seen_at: 0,
        proxy_port: state.config.port,
        control_port: state.config.control_port,
        password_hash: hello.password.as_deref().map(password_sha256_hex),
    };
    if let Err(e) = state.registry.register_tunnel(record).await {
        tracing::error!(subdomain = %sub_domain, error = %e, "Failed to register tunnel in registry");
    }

    let hostname = render_domain(&state.config.domain, &sub_domain);
    let public_url = render_public_url(&state.config.public_url, &hostname, state.config.port);
    let success = ServerHello::success(
        sub_domain.clone(),
        hostname.clone(),
        public_url,
        client_id.clone(),
    );
    if !send_hello(&mut socket, &success).await {
        state.conn_mgr.remove_client(&client_id);
        if let Err(e) = state.registry.unregister_tunnel(&sub_domain).await {
            tracing::error!(subdomain = %sub_domain, error = %e, "Failed to unregister tunnel");
        }
        return;
    }

    tracing::info!(
        client_id = %client_id,
        subdomain = %sub_domain,
        hostname = %hostname,
        "Tunnel established"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, send_rx, Arc::clone(&connection)));
    read_pump(stream, Arc::clone(&connection)).await;

    state.conn_mgr.remove_client(&client_id);
    if let Err(e) = state.registry.unregister_tunnel(&sub_domain).await {
        tracing::error!(subdomain = %sub_domain, error = %e, "Failed to unregister tunnel");
    }
    writer.abort();
}

async fn read_hello(socket: &mut WebSocket) -> Result<ClientHello, String> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, socket.recv())
        .await
        .map_err(|_| "hello deadline exceeded".to_string())?;

    match frame {
        Some(Ok(WsMessage::Text(text))) => {
            decode_frame::<ClientHello>(text.as_str()).map_err(|e| e.to_string())
        }
        Some(Ok(_)) => Err("expected a text hello frame".to_string()),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("connection closed before hello".to_string()),
    }
}

async fn send_hello(socket: &mut WebSocket, hello: &ServerHello) -> bool {
    let text = match encode_frame(hello) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server hello");
            return false;
        }
    };
    socket.send(WsMessage::Text(text.into())).await.is_ok()
}

/// Check the hello against the auth policy and settle the subdomain.
fn authenticate(
    state: &ControlState,
    hello: &ClientHello,
) -> Result<(ClientId, String), ServerHello> {
    let client_id = match hello.client_type {
        ClientType::Auth => {
            let Some(key) = &hello.secret_key else {
                return Err(ServerHello::rejection(
                    ServerHelloType::AuthFailed,
                    "Secret key required",
                ));
            };
            // Deterministic id: the same key always maps to the same client.
            key.client_id()
        }
        ClientType::Anonymous => {
            if state.config.require_auth || !state.config.allow_anonymous {
                return Err(ServerHello::rejection(
                    ServerHelloType::AuthFailed,
                    "Anonymous clients not allowed",
                ));
            }
            hello.id.clone()
        }
    };

    let sub_domain = match &hello.sub_domain {
        Some(requested) => {
            if let Err(e) = validate_sub_domain(requested) {
                return Err(ServerHello::rejection(
                    ServerHelloType::InvalidSubDomain,
                    e.to_string(),
                ));
            }
            requested.clone()
        }
        None => generate_sub_domain(),
    };

    if !state.conn_mgr.is_sub_domain_available(&sub_domain) {
        // The same client re-claiming its own subdomain is settled by the
        // connection manager; any other holder is a conflict.
        let held_by_self = state
            .conn_mgr
            .get_by_sub_domain(&sub_domain)
            .map(|conn| conn.id == client_id)
            .unwrap_or(false);
        if !held_by_self {
            return Err(ServerHello::rejection(
                ServerHelloType::SubDomainInUse,
                "Subdomain is already in use",
            ));
        }
    }

    Ok((client_id, sub_domain))
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut send_rx: mpsc::Receiver<String>,
    connection: Arc<ClientConnection>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.reset(); // skip the immediate first tick

    loop {
        tokio::select! {
            frame = send_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                };
                if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                    tracing::error!(client_id = %connection.id, error = %e, "Control write error");
                    return;
                }
            }
            _ = ping.tick() => {
                let ping_msg = Message::new(MessageType::Ping, None);
                let Ok(text) = encode_frame(&ping_msg) else { continue };
                if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                    tracing::error!(client_id = %connection.id, error = %e, "Failed to send ping");
                    return;
                }
            }
            _ = connection.closed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return;
            }
        }
    }
}

async fn read_pump(mut stream: SplitStream<WebSocket>, connection: Arc<ClientConnection>) {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            // Revocation (shutdown, removal) must unblock a reader whose
            // peer has gone quiet.
            _ = connection.closed() => return,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                let message = match decode_frame::<Message>(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(client_id = %connection.id, error = %e, "Failed to decode message");
                        continue;
                    }
                };
                dispatch(&connection, &message);
            }
            Some(Ok(WsMessage::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!(client_id = %connection.id, error = %e, "Control read error");
                return;
            }
        }
    }
}

fn dispatch(connection: &ClientConnection, message: &Message) {
    match message.msg_type {
        MessageType::Pong => {
            tracing::debug!(client_id = %connection.id, "Received pong");
        }
        MessageType::Data => {
            let Some(stream_id) = &message.stream_id else {
                tracing::warn!(client_id = %connection.id, "Data message without stream id");
                return;
            };
            let Some(stream) = connection.get_stream(stream_id) else {
                tracing::warn!(stream_id = %stream_id, "Stream not found for data message");
                return;
            };
            let chunk = match message.decode_data::<DataMessage>() {
                Ok(data) => data.data,
                Err(e) => {
                    tracing::error!(stream_id = %stream_id, error = %e, "Failed to decode data message");
                    return;
                }
            };
            match stream.deliver(chunk) {
                Ok(()) => {}
                Err(SendError::BufferFull) => {
                    // The router normally drains as fast as the client
                    // writes; a full channel means the request already
                    // stalled, so the chunk is dropped.
                    tracing::warn!(stream_id = %stream_id, "Stream data channel full, chunk dropped");
                }
                Err(SendError::Closed) => {
                    tracing::debug!(stream_id = %stream_id, "Stream closed while delivering data");
                }
            }
        }
        MessageType::End => {
            if let Some(stream_id) = &message.stream_id {
                tracing::debug!(stream_id = %stream_id, "Received stream end");
                connection.remove_stream(stream_id);
            }
        }
        MessageType::Ping => {
            let pong = Message::new(MessageType::Pong, None);
            if let Err(e) = connection.send_message(&pong) {
                tracing::warn!(client_id = %connection.id, error = %e, "Failed to enqueue pong");
            }
        }
        MessageType::Init => {
            tracing::warn!(client_id = %connection.id, "Unexpected init from client");
        }
    }
}
