//! Client engine: dial, hello, pumps, and the reconnect loop.
//!
//! # Responsibilities
//! - Dial the current cluster member and exchange hellos
//! - Dispatch inbound messages onto local streams
//! - Drain the outbound queue and emit keepalives
//! - Re-dial on failure and rotate across cluster members
//!
//! # Design Decisions
//! - The subdomain granted on the first connect is carried into every
//!   reconnect hello so the public URL stays stable across drops
//! - The keepalive tick emits a `pong`; the server accepts either direction
//!   of the ping/pong pair
//! - A lost control connection never fails the process; the engine re-enters
//!   the reconnect loop until told to shut down

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TgMessage;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use crate::client::origin::{open_local_stream, LocalStream};
use crate::config::{ClientConfig, ServerNode};
use crate::protocol::{
    decode_frame, encode_frame, ClientHello, DataMessage, InitStreamMessage, Message, MessageType,
    ReconnectToken, SecretKey, ServerHello, ServerHelloType, StreamId,
};

/// An established control connection.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue capacity between the dispatch loop and the write pump.
const SEND_QUEUE: usize = 512;

/// Keepalive period on the write pump.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Cap on the extended delay after a full unsuccessful rotation.
const MAX_CYCLE_DELAY: Duration = Duration::from_secs(30);

/// Error type for connection establishment.
#[derive(Debug)]
pub enum ClientError {
    /// The control URL could not be constructed.
    BadUrl(String),
    /// TLS setup failed.
    Tls(String),
    /// The dial or WebSocket handshake failed.
    Connect(String),
    /// The hello exchange failed or timed out.
    Hello(String),
    /// The server answered with a non-success hello.
    Rejected {
        hello_type: ServerHelloType,
        message: String,
    },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::BadUrl(e) => write!(f, "invalid control URL: {}", e),
            ClientError::Tls(e) => write!(f, "TLS setup failed: {}", e),
            ClientError::Connect(e) => write!(f, "failed to connect: {}", e),
            ClientError::Hello(e) => write!(f, "hello exchange failed: {}", e),
            ClientError::Rejected { hello_type, message } => {
                write!(f, "server rejected connection: {:?} - {}", hello_type, message)
            }
        }
    }
}

impl std::error::Error for ClientError {}

/// Shared state of one established session, visible to the stream workers.
pub(crate) struct Session {
    pub config: Arc<ClientConfig>,
    pub streams: Arc<DashMap<StreamId, Arc<LocalStream>>>,
    pub send_tx: mpsc::Sender<String>,
    pub cancel: CancellationToken,
}

/// The tunnel client: maintains one control connection to the cluster and
/// mirrors server-initiated streams onto the local origin.
pub struct TunnelClient {
    config: Arc<ClientConfig>,
    server_list: Vec<ServerNode>,
    current_idx: usize,
    server_info: Option<ServerHello>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        let server_list = config.server_list();
        Self {
            config: Arc::new(config),
            server_list,
            current_idx: 0,
            server_info: None,
        }
    }

    /// The last successful server hello, if any.
    pub fn server_info(&self) -> Option<&ServerHello> {
        self.server_info.as_ref()
    }

    pub fn current_server(&self) -> &ServerNode {
        &self.server_list[self.current_idx]
    }

    pub fn server_count(&self) -> usize {
        self.server_list.len()
    }

    fn rotate(&mut self) {
        self.current_idx = (self.current_idx + 1) % self.server_list.len();
        let node = self.current_server();
        tracing::info!(
            server = %format!("{}:{}", node.host, node.port),
            index = self.current_idx,
            total = self.server_list.len(),
            "Rotated to next server"
        );
    }

    /// Run until `shutdown` is cancelled: connect, serve, reconnect.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        let retry_interval = Duration::from_secs(self.config.retry_interval_secs);
        let cycle_delay = (retry_interval * 6).min(MAX_CYCLE_DELAY);
        let mut first_connection = true;
        let mut rotation = 0usize;

        'reconnect: loop {
            for retry in 0..=self.config.max_retries {
                if shutdown.is_cancelled() {
                    return;
                }
                if retry > 0 || !first_connection {
                    let node = self.current_server();
                    tracing::info!(
                        retry,
                        max_retries = self.config.max_retries,
                        server = %format!("{}:{}", node.host, node.port),
                        "Waiting before reconnect attempt"
                    );
                    if !sleep_unless_cancelled(retry_interval, &shutdown).await {
                        return;
                    }
                }

                let ws = match self.connect().await {
                    Ok(ws) => ws,
                    Err(e) => {
                        let node = self.current_server();
                        tracing::error!(
                            server = %format!("{}:{}", node.host, node.port),
                            error = %e,
                            "Failed to connect to server"
                        );
                        if retry == self.config.max_retries {
                            if self.server_list.len() > 1 {
                                self.rotate();
                                rotation += 1;
                                if rotation >= self.server_list.len() {
                                    // Tried every member; back off before the
                                    // next cycle to avoid thrash.
                                    tracing::warn!("Tried every cluster member, backing off");
                                    rotation = 0;
                                    if !sleep_unless_cancelled(cycle_delay, &shutdown).await {
                                        return;
                                    }
                                }
                            } else if !sleep_unless_cancelled(retry_interval, &shutdown).await {
                                return;
                            }
                        }
                        continue;
                    }
                };

                rotation = 0;
                let info = self.server_info.as_ref();
                let public_url = info.and_then(|i| i.public_url.clone()).unwrap_or_default();
                let sub_domain = info.and_then(|i| i.sub_domain.clone()).unwrap_or_default();
                if first_connection {
                    tracing::info!(
                        url = %public_url,
                        subdomain = %sub_domain,
                        cluster_size = self.server_list.len(),
                        local = %format!("{}:{}", self.config.local_host, self.config.local_port),
                        "Tunnel established"
                    );
                    first_connection = false;
                } else {
                    tracing::info!(url = %public_url, subdomain = %sub_domain, "Reconnected");
                }

                self.serve(ws, &shutdown).await;
                if shutdown.is_cancelled() {
                    return;
                }
                tracing::warn!("Connection lost, will reconnect");
                continue 'reconnect;
            }
        }
    }

    /// Dial the current member and run the hello exchange.
    pub async fn connect(&mut self) -> Result<WsStream, ClientError> {
        let node = self.current_server().clone();
        let scheme = if node.secure { "wss" } else { "ws" };
        let url = format!("{}://{}:{}/ws", scheme, node.host, node.port);

        tracing::info!(
            url = %url,
            index = self.current_idx,
            total = self.server_list.len(),
            "Connecting to server"
        );

        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|e| ClientError::BadUrl(e.to_string()))?;
        request.headers_mut().insert(
            "user-agent",
            format!("tungo-client/{}", env!("CARGO_PKG_VERSION"))
                .parse()
                .map_err(|_| ClientError::BadUrl("invalid user agent".into()))?,
        );

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let dialed = if node.secure && self.config.insecure_tls {
            tracing::warn!("TLS certificate verification disabled (insecure mode)");
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .map_err(|e| ClientError::Tls(e.to_string()))?;
            tokio::time::timeout(
                connect_timeout,
                connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls))),
            )
            .await
        } else {
            tokio::time::timeout(connect_timeout, connect_async(request)).await
        };

        let (mut ws, _response) = dialed
            .map_err(|_| ClientError::Connect("connect timeout".into()))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let hello = self.build_hello();
        let text = encode_frame(&hello).map_err(|e| ClientError::Hello(e.to_string()))?;
        ws.send(TgMessage::Text(text.into()))
            .await
            .map_err(|e| ClientError::Hello(e.to_string()))?;

        let server_hello = read_server_hello(&mut ws, connect_timeout).await?;
        if server_hello.hello_type != ServerHelloType::Success {
            return Err(ClientError::Rejected {
                hello_type: server_hello.hello_type,
                message: server_hello.error.unwrap_or_default(),
            });
        }

        tracing::info!(
            subdomain = %server_hello.sub_domain.as_deref().unwrap_or(""),
            hostname = %server_hello.hostname.as_deref().unwrap_or(""),
            "Hello accepted"
        );
        self.server_info = Some(server_hello);
        Ok(ws)
    }

    fn build_hello(&self) -> ClientHello {
        if !self.config.reconnect_token.is_empty() {
            let mut hello = ClientHello::new(None, None);
            hello.reconnect_token = Some(ReconnectToken {
                token: self.config.reconnect_token.clone(),
            });
            hello.client_version = Some(env!("CARGO_PKG_VERSION").to_string());
            return hello;
        }

        // Prefer the subdomain granted last session so reconnects keep the
        // same public URL.
        let sub_domain = self
            .server_info
            .as_ref()
            .and_then(|info| info.sub_domain.clone())
            .or_else(|| {
                (!self.config.subdomain.is_empty()).then(|| self.config.subdomain.clone())
            });

        let secret_key = (!self.config.secret_key.is_empty()).then(|| SecretKey {
            key: self.config.secret_key.clone(),
        });

        let mut hello = ClientHello::new(sub_domain, secret_key);
        hello.client_version = Some(env!("CARGO_PKG_VERSION").to_string());
        if !self.config.password.is_empty() {
            hello.password = Some(self.config.password.clone());
        }
        hello
    }

    /// Serve one established session until the connection drops or shutdown
    /// is requested.
    pub async fn serve(&mut self, ws: WsStream, shutdown: &CancellationToken) {
        let (sink, mut stream) = ws.split();
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE);
        let cancel = CancellationToken::new();

        let session = Arc::new(Session {
            config: Arc::clone(&self.config),
            streams: Arc::new(DashMap::new()),
            send_tx,
            cancel: cancel.clone(),
        });

        let writer = tokio::spawn(write_pump(sink, send_rx, cancel.clone()));

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(TgMessage::Text(text))) => dispatch(&session, text.as_str()).await,
                        Some(Ok(TgMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Control read error");
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        cancel.cancel();
        for entry in session.streams.iter() {
            entry.value().revoke();
        }
        session.streams.clear();
        let _ = writer.await;
    }
}

async fn sleep_unless_cancelled(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}

async fn read_server_hello(ws: &mut WsStream, deadline: Duration) -> Result<ServerHello, ClientError> {
    let frame = tokio::time::timeout(deadline, ws.next())
        .await
        .map_err(|_| ClientError::Hello("server hello timeout".into()))?;

    match frame {
        Some(Ok(TgMessage::Text(text))) => {
            decode_frame(text.as_str()).map_err(|e| ClientError::Hello(e.to_string()))
        }
        Some(Ok(_)) => Err(ClientError::Hello("expected a text hello frame".into())),
        Some(Err(e)) => Err(ClientError::Hello(e.to_string())),
        None => Err(ClientError::Hello("connection closed before hello".into())),
    }
}

async fn write_pump(
    mut sink: SplitSink<WsStream, TgMessage>,
    mut send_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.reset();

    loop {
        tokio::select! {
            frame = send_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(TgMessage::Close(None)).await;
                    return;
                };
                if let Err(e) = sink.send(TgMessage::Text(frame.into())).await {
                    tracing::warn!(error = %e, "Control write error");
                    return;
                }
            }
            _ = keepalive.tick() => {
                // Heartbeat; the server accepts a pong here as liveness.
                let pong = Message::new(MessageType::Pong, None);
                let Ok(text) = encode_frame(&pong) else { continue };
                if let Err(e) = sink.send(TgMessage::Text(text.into())).await {
                    tracing::debug!(error = %e, "Failed to send keepalive");
                    return;
                }
            }
            _ = cancel.cancelled() => {
                let _ = sink.send(TgMessage::Close(None)).await;
                return;
            }
        }
    }
}

async fn dispatch(session: &Arc<Session>, text: &str) {
    let message = match decode_frame::<Message>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode message");
            return;
        }
    };

    match message.msg_type {
        MessageType::Ping => {
            let pong = Message::new(MessageType::Pong, None);
            if let Ok(text) = encode_frame(&pong) {
                if session.send_tx.try_send(text).is_err() {
                    tracing::warn!("Send buffer full, dropping pong");
                }
            }
        }
        MessageType::Init => {
            let init = match message.decode_data::<InitStreamMessage>() {
                Ok(init) => init,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to decode init message");
                    return;
                }
            };
            handle_init(session, init).await;
        }
        MessageType::Data => {
            let Some(stream_id) = &message.stream_id else {
                tracing::warn!("Data message without stream id");
                return;
            };
            let Some(stream) = session.streams.get(stream_id).map(|s| Arc::clone(s.value())) else {
                tracing::warn!(stream_id = %stream_id, "Stream not found for data message");
                return;
            };
            match message.decode_data::<DataMessage>() {
                Ok(data) => stream.deliver(data.data),
                Err(e) => tracing::error!(stream_id = %stream_id, error = %e, "Failed to decode data message"),
            }
        }
        MessageType::End => {
            if let Some(stream_id) = &message.stream_id {
                tracing::debug!(stream_id = %stream_id, "Received stream end");
                if let Some((_, stream)) = session.streams.remove(stream_id) {
                    stream.revoke();
                }
            }
        }
        MessageType::Pong => {
            tracing::debug!("Received pong");
        }
    }
}

async fn handle_init(session: &Arc<Session>, init: InitStreamMessage) {
    tracing::debug!(
        stream_id = %init.stream_id,
        protocol = %init.protocol,
        "Initializing stream"
    );

    let opened = open_local_stream(
        init.stream_id.clone(),
        &session.config.local_host,
        session.config.local_port,
        session.config.capture_traffic,
        session.send_tx.clone(),
        Arc::clone(&session.streams),
        &session.cancel,
    )
    .await;

    if !opened {
        // Origin unreachable: report the stream as ended right away.
        let end = Message::new(MessageType::End, Some(init.stream_id));
        if let Ok(text) = encode_frame(&end) {
            let _ = session.send_tx.try_send(text);
        }
    }
}
