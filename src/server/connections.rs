//! Live control connections and their stream tables.
//!
//! # Responsibilities
//! - Index control connections by client id and by subdomain
//! - Enforce the connection limit and subdomain exclusivity
//! - Own each connection's bounded outbound queue and liveness token
//! - Multiplex per-request streams over a single control connection
//!
//! # Design Decisions
//! - One read-write lock guards both index maps so additions and removals
//!   are atomic with respect to each other
//! - Stream tables live outside the manager lock; no operation touches a
//!   stream while holding the manager lock
//! - Queue sends never block: a full queue fails fast so a slow tenant
//!   cannot stall a fast one

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{encode_frame, ClientId, Message, StreamId};

/// Capacity of each connection's outbound queue and of each stream's
/// inbound chunk channel.
pub const QUEUE_CAPACITY: usize = 512;

/// Error type for queue sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound queue is full; the frame was not enqueued.
    BufferFull,
    /// The connection's liveness was revoked.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::BufferFull => write!(f, "send buffer full"),
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Error type for connection admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The server is at `max_connections`.
    LimitReached,
    /// The subdomain is held by a different client.
    SubdomainInUse,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::LimitReached => write!(f, "maximum connections reached"),
            ConnectionError::SubdomainInUse => write!(f, "subdomain already in use"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// One in-flight public request multiplexed over a control connection.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub protocol: String,
    /// Public address of the originating request, for logging.
    pub remote_addr: String,
    data_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Stream {
    /// Non-blocking delivery of one inbound chunk. A full channel drops the
    /// chunk; a revoked stream reports [`SendError::Closed`].
    pub fn deliver(&self, chunk: Vec<u8>) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.data_tx.try_send(chunk).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Revoke liveness; all readers and writers unblock.
    pub fn revoke(&self) {
        self.cancel.cancel();
    }

    pub fn is_revoked(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when liveness is revoked.
    pub fn revoked(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// A connected tunnel client.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ClientId,
    pub sub_domain: String,
    pub client_version: Option<String>,
    /// Plaintext tunnel password; only the owning server holds it.
    pub password: Option<String>,
    streams: DashMap<StreamId, Arc<Stream>>,
    send_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl ClientConnection {
    fn new(
        id: ClientId,
        sub_domain: String,
        client_version: Option<String>,
        password: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let connection = Arc::new(Self {
            id,
            sub_domain,
            client_version,
            password,
            streams: DashMap::new(),
            send_tx,
            cancel: CancellationToken::new(),
        });
        (connection, send_rx)
    }

    /// Create a stream and its inbound channel. The returned receiver is
    /// handed to the single response reader; the table keeps only the
    /// sending side.
    pub fn add_stream(
        &self,
        id: StreamId,
        protocol: &str,
        remote_addr: &str,
    ) -> (Arc<Stream>, mpsc::Receiver<Vec<u8>>) {
        let (data_tx, data_rx) = mpsc::channel(QUEUE_CAPACITY);
        let stream = Arc::new(Stream {
            id: id.clone(),
            protocol: protocol.to_string(),
            remote_addr: remote_addr.to_string(),
            data_tx,
            cancel: self.cancel.child_token(),
        });
        self.streams.insert(id.clone(), Arc::clone(&stream));

        tracing::debug!(
            stream_id = %id,
            protocol = %protocol,
            remote_addr = %remote_addr,
            "Stream added"
        );
        (stream, data_rx)
    }

    pub fn get_stream(&self, id: &StreamId) -> Option<Arc<Stream>> {
        self.streams.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a stream and revoke its liveness. Idempotent.
    pub fn remove_stream(&self, id: &StreamId) {
        if let Some((_, stream)) = self.streams.remove(id) {
            stream.revoke();
            tracing::debug!(stream_id = %id, "Stream removed");
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Encode a message and enqueue it for the write pump. Never blocks.
    pub fn send_message(&self, message: &Message) -> Result<(), SendError> {
        let text = encode_frame(message).map_err(|e| {
            tracing::error!(error = %e, "Failed to encode outbound message");
            SendError::Closed
        })?;
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.send_tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Revoke the connection and every stream under it, unblocking all
    /// workers. The stream table is cleared.
    pub fn revoke(&self) {
        self.cancel.cancel();
        self.streams.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the connection's liveness is revoked.
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

struct Index {
    clients: HashMap<ClientId, Arc<ClientConnection>>,
    subdomains: HashMap<String, ClientId>,
}

/// Per-server index of live control connections.
pub struct ConnectionManager {
    index: RwLock<Index>,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            index: RwLock::new(Index {
                clients: HashMap::new(),
                subdomains: HashMap::new(),
            }),
            max_connections,
        }
    }

    /// Admit a new client. Fails when the server is full or the subdomain is
    /// held by a different client id.
    pub fn add_client(
        &self,
        id: ClientId,
        sub_domain: String,
        client_version: Option<String>,
        password: Option<String>,
    ) -> Result<(Arc<ClientConnection>, mpsc::Receiver<String>), ConnectionError> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());

        if index.clients.len() >= self.max_connections {
            return Err(ConnectionError::LimitReached);
        }
        if let Some(existing) = index.subdomains.get(&sub_domain) {
            if *existing != id {
                return Err(ConnectionError::SubdomainInUse);
            }
        }

        let (connection, send_rx) =
            ClientConnection::new(id.clone(), sub_domain.clone(), client_version, password);
        index.clients.insert(id.clone(), Arc::clone(&connection));
        index.subdomains.insert(sub_domain.clone(), id.clone());
        drop(index);

        tracing::info!(client_id = %id, subdomain = %sub_domain, "Client connected");
        Ok((connection, send_rx))
    }

    /// Remove a client: the index entries go atomically, then liveness is
    /// revoked for the connection and every stream under it.
    pub fn remove_client(&self, id: &ClientId) {
        let connection = {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            let Some(connection) = index.clients.remove(id) else {
                return;
            };
            index.subdomains.remove(&connection.sub_domain);
            connection
        };

        connection.revoke();
        tracing::info!(
            client_id = %id,
            subdomain = %connection.sub_domain,
            "Client disconnected"
        );
    }

    pub fn get_client(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.clients.get(id).cloned()
    }

    pub fn get_by_sub_domain(&self, sub_domain: &str) -> Option<Arc<ClientConnection>> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let id = index.subdomains.get(sub_domain)?;
        index.clients.get(id).cloned()
    }

    pub fn is_sub_domain_available(&self, sub_domain: &str) -> bool {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        !index.subdomains.contains_key(sub_domain)
    }

    pub fn active_connections(&self) -> usize {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.clients.len()
    }

    pub fn list_sub_domains(&self) -> Vec<String> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.subdomains.keys().cloned().collect()
    }

    /// Revoke every connection. Used at shutdown after the listeners stop.
    pub fn revoke_all(&self) {
        let connections: Vec<Arc<ClientConnection>> = {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            index.subdomains.clear();
            index.clients.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.revoke();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(2)
    }

    #[tokio::test]
    async fn subdomain_exclusivity() {
        let mgr = manager();
        let a = ClientId::generate();
        let b = ClientId::generate();

        mgr.add_client(a.clone(), "shared".into(), None, None).unwrap();
        let err = mgr
            .add_client(b, "shared".into(), None, None)
            .unwrap_err();
        assert_eq!(err, ConnectionError::SubdomainInUse);

        // The same client id may re-claim its own subdomain.
        assert!(mgr.add_client(a, "shared".into(), None, None).is_ok());
    }

    #[tokio::test]
    async fn connection_limit() {
        let mgr = manager();
        mgr.add_client(ClientId::generate(), "one".into(), None, None).unwrap();
        mgr.add_client(ClientId::generate(), "two".into(), None, None).unwrap();

        let err = mgr
            .add_client(ClientId::generate(), "three".into(), None, None)
            .unwrap_err();
        assert_eq!(err, ConnectionError::LimitReached);
    }

    #[tokio::test]
    async fn removal_revokes_streams_and_frees_subdomain() {
        let mgr = manager();
        let id = ClientId::generate();
        let (conn, _rx) = mgr.add_client(id.clone(), "demo".into(), None, None).unwrap();

        let (stream, _data_rx) = conn.add_stream(StreamId::generate(), "http", "1.2.3.4");
        assert!(!stream.is_revoked());

        mgr.remove_client(&id);
        assert!(stream.is_revoked());
        assert!(conn.is_closed());
        assert!(mgr.is_sub_domain_available("demo"));
        assert!(mgr.get_client(&id).is_none());
    }

    #[tokio::test]
    async fn queue_fails_fast_when_full() {
        let mgr = ConnectionManager::new(8);
        let (conn, mut rx) = mgr
            .add_client(ClientId::generate(), "demo".into(), None, None)
            .unwrap();

        for _ in 0..QUEUE_CAPACITY {
            conn.send_message(&Message::new(MessageType::Ping, None)).unwrap();
        }
        let err = conn
            .send_message(&Message::new(MessageType::Ping, None))
            .unwrap_err();
        assert_eq!(err, SendError::BufferFull);

        // Draining one slot lets the next send through.
        rx.recv().await.unwrap();
        conn.send_message(&Message::new(MessageType::Ping, None)).unwrap();
    }

    #[tokio::test]
    async fn send_after_revoke_is_closed() {
        let mgr = manager();
        let (conn, _rx) = mgr
            .add_client(ClientId::generate(), "demo".into(), None, None)
            .unwrap();
        conn.revoke();

        let err = conn
            .send_message(&Message::new(MessageType::Ping, None))
            .unwrap_err();
        assert_eq!(err, SendError::Closed);
    }

    #[tokio::test]
    async fn stream_chunk_delivery_drops_when_full() {
        let mgr = manager();
        let (conn, _rx) = mgr
            .add_client(ClientId::generate(), "demo".into(), None, None)
            .unwrap();
        let (stream, mut data_rx) = conn.add_stream(StreamId::generate(), "http", "1.2.3.4");

        for _ in 0..QUEUE_CAPACITY {
            stream.deliver(vec![0u8]).unwrap();
        }
        assert_eq!(stream.deliver(vec![0u8]).unwrap_err(), SendError::BufferFull);

        let chunk = data_rx.recv().await.unwrap();
        assert_eq!(chunk, vec![0u8]);
    }

    #[tokio::test]
    async fn remove_stream_is_idempotent() {
        let mgr = manager();
        let (conn, _rx) = mgr
            .add_client(ClientId::generate(), "demo".into(), None, None)
            .unwrap();
        let id = StreamId::generate();
        let (stream, _data_rx) = conn.add_stream(id.clone(), "http", "1.2.3.4");

        conn.remove_stream(&id);
        conn.remove_stream(&id);
        assert!(stream.is_revoked());
        assert!(conn.get_stream(&id).is_none());
    }
}
