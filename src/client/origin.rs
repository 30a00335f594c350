//! Local origin adapter: one short-lived TCP connection per stream.
//!
//! # Responsibilities
//! - Open a TCP connection to the configured local origin per `init`
//! - Forward server-delivered request bytes onto the socket
//! - Read the origin's response and emit it back as `data` frames
//! - Detect end-of-response with staged read deadlines
//!
//! # Design Decisions
//! - The response boundary is inferred, not parsed: a 5 s deadline covers
//!   the wait for the first byte, then 500 ms deadlines detect the gap
//!   after the last byte. An origin that holds the socket open still
//!   completes promptly
//! - Optional capture buffers are bounded so inspection can never grow
//!   memory without limit

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{encode_frame, DataMessage, Message, MessageType, StreamId};

/// Capacity of a stream's inbound chunk channel.
const STREAM_BUFFER: usize = 512;

/// Deadline for the origin's first response byte.
const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline between response bytes once data has flowed.
const NEXT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Overall budget for one response.
const RESPONSE_BUDGET: Duration = Duration::from_secs(30);

/// Deadline for dialing the local origin.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on each capture buffer.
const CAPTURE_LIMIT: usize = 256 * 1024;

/// Per-request access log fields, filled in as bytes flow.
#[derive(Default)]
struct AccessLog {
    method: String,
    path: String,
    source_ip: String,
    status: u16,
}

/// Client-side stream state: the bridge between the control connection and
/// one local TCP connection.
pub struct LocalStream {
    pub id: StreamId,
    data_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    started: Instant,
    log: Mutex<AccessLog>,
    capture_enabled: bool,
    request_capture: Mutex<Vec<u8>>,
    response_capture: Mutex<Vec<u8>>,
}

impl LocalStream {
    /// Non-blocking delivery of a server-sent chunk; a full channel drops
    /// the chunk with a warning.
    pub fn deliver(&self, chunk: Vec<u8>) {
        if self.cancel.is_cancelled() {
            tracing::debug!(stream_id = %self.id, "Stream closed while delivering data");
            return;
        }
        if self.data_tx.try_send(chunk).is_err() {
            tracing::warn!(stream_id = %self.id, "Stream data channel full, chunk dropped");
        }
    }

    /// Revoke liveness; both workers exit and the socket halves drop.
    pub fn revoke(&self) {
        self.cancel.cancel();
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }
}

/// Dial the local origin and wire up a new stream's workers. The stream
/// registers itself in `streams` and removes itself when it finishes.
///
/// Returns `false` when the origin is unreachable; the caller reports the
/// stream end to the server.
pub async fn open_local_stream(
    id: StreamId,
    local_host: &str,
    local_port: u16,
    capture_enabled: bool,
    send_tx: mpsc::Sender<String>,
    streams: Arc<DashMap<StreamId, Arc<LocalStream>>>,
    parent: &CancellationToken,
) -> bool {
    let target = format!("{}:{}", local_host, local_port);
    let socket = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            tracing::error!(stream_id = %id, target = %target, error = %e, "Failed to connect to local origin");
            return false;
        }
        Err(_) => {
            tracing::error!(stream_id = %id, target = %target, "Timed out connecting to local origin");
            return false;
        }
    };

    let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
    let stream = Arc::new(LocalStream {
        id,
        data_tx,
        cancel: parent.child_token(),
        bytes_sent: AtomicU64::new(0),
        bytes_recv: AtomicU64::new(0),
        started: Instant::now(),
        log: Mutex::new(AccessLog::default()),
        capture_enabled,
        request_capture: Mutex::new(Vec::new()),
        response_capture: Mutex::new(Vec::new()),
    });

    streams.insert(stream.id.clone(), Arc::clone(&stream));

    let (read_half, write_half) = socket.into_split();
    let (written_tx, written_rx) = oneshot::channel();

    tokio::spawn(write_to_origin(Arc::clone(&stream), data_rx, write_half, written_tx));
    tokio::spawn(read_from_origin(
        Arc::clone(&stream),
        read_half,
        written_rx,
        send_tx,
        streams,
    ));

    true
}

/// Forward request bytes from the control connection to the origin socket.
async fn write_to_origin(
    stream: Arc<LocalStream>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    mut socket: OwnedWriteHalf,
    written_tx: oneshot::Sender<()>,
) {
    let mut written_tx = Some(written_tx);

    loop {
        let chunk = tokio::select! {
            chunk = data_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => return,
            },
            _ = stream.cancel.cancelled() => return,
        };

        // The first chunk carries the request head; lift out the log fields.
        if written_tx.is_some() {
            parse_request_head(&stream, &chunk);
        }
        if stream.capture_enabled {
            capture_bounded(&stream.request_capture, &chunk);
        }

        if let Err(e) = socket.write_all(&chunk).await {
            tracing::debug!(stream_id = %stream.id, error = %e, "Failed to write to local origin");
            return;
        }
        stream
            .bytes_sent
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);

        // The reader holds off until the request has hit the socket.
        if let Some(tx) = written_tx.take() {
            let _ = tx.send(());
            tracing::debug!(stream_id = %stream.id, bytes = chunk.len(), "Request written to local origin");
        }
    }
}

/// Read the origin's response and emit it as `data` frames, closing with
/// `end` once the response boundary is detected.
async fn read_from_origin(
    stream: Arc<LocalStream>,
    mut socket: OwnedReadHalf,
    written_rx: oneshot::Receiver<()>,
    send_tx: mpsc::Sender<String>,
    streams: Arc<DashMap<StreamId, Arc<LocalStream>>>,
) {
    // Wait for the request to be written before reading the response.
    tokio::select! {
        result = written_rx => {
            if result.is_err() {
                finalize(&stream, &send_tx, &streams).await;
                return;
            }
        }
        _ = stream.cancel.cancelled() => {
            streams.remove(&stream.id);
            return;
        }
    }
    // Give the origin a beat to start producing.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let budget = Instant::now() + RESPONSE_BUDGET;
    let mut buf = vec![0u8; 32 * 1024];
    let mut first_read_done = false;

    loop {
        if stream.cancel.is_cancelled() {
            streams.remove(&stream.id);
            return;
        }

        let deadline = if first_read_done {
            NEXT_READ_TIMEOUT
        } else {
            FIRST_READ_TIMEOUT
        };

        let read = tokio::select! {
            read = tokio::time::timeout(deadline, socket.read(&mut buf)) => read,
            _ = stream.cancel.cancelled() => {
                streams.remove(&stream.id);
                return;
            }
        };

        match read {
            Err(_) => {
                // Deadline lapsed. With bytes in hand the response is done;
                // with none, keep waiting inside the overall budget.
                if stream.bytes_recv() > 0 || Instant::now() >= budget {
                    break;
                }
                continue;
            }
            Ok(Err(e)) => {
                tracing::debug!(stream_id = %stream.id, error = %e, "Local origin connection closed");
                break;
            }
            Ok(Ok(0)) => {
                tracing::debug!(stream_id = %stream.id, "EOF from local origin, response complete");
                break;
            }
            Ok(Ok(n)) => {
                let chunk = &buf[..n];
                if !first_read_done {
                    first_read_done = true;
                    parse_response_status(&stream, chunk);
                }
                stream.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
                if stream.capture_enabled {
                    capture_bounded(&stream.response_capture, chunk);
                }

                let message = match Message::with_data(
                    MessageType::Data,
                    Some(stream.id.clone()),
                    &DataMessage { data: chunk.to_vec() },
                ) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(stream_id = %stream.id, error = %e, "Failed to build data frame");
                        break;
                    }
                };
                let Ok(frame) = encode_frame(&message) else { break };

                // Backpressure: wait for queue space, but never forever.
                let sent = tokio::select! {
                    sent = tokio::time::timeout(Duration::from_secs(5), send_tx.send(frame)) => sent,
                    _ = stream.cancel.cancelled() => {
                        streams.remove(&stream.id);
                        return;
                    }
                };
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => {
                        tracing::warn!(stream_id = %stream.id, "Send buffer full, abandoning stream");
                        break;
                    }
                }
            }
        }
    }

    finalize(&stream, &send_tx, &streams).await;
}

async fn finalize(
    stream: &LocalStream,
    send_tx: &mpsc::Sender<String>,
    streams: &DashMap<StreamId, Arc<LocalStream>>,
) {
    // Self-removal: once a stream finishes it no longer accepts data.
    if let Some((_, entry)) = streams.remove(&stream.id) {
        entry.revoke();
    }

    if let Ok(end) = encode_frame(&Message::new(MessageType::End, Some(stream.id.clone()))) {
        if send_tx.try_send(end).is_err() {
            tracing::warn!(stream_id = %stream.id, "Failed to send stream end");
        }
    }

    let latency_ms = stream.started.elapsed().as_millis();
    let log = stream.log.lock().unwrap_or_else(|e| e.into_inner());
    if log.status > 0 && !log.method.is_empty() {
        tracing::info!(
            method = %log.method,
            path = %log.path,
            status = log.status,
            source_ip = %if log.source_ip.is_empty() { "-" } else { log.source_ip.as_str() },
            bytes_sent = stream.bytes_sent(),
            bytes_recv = stream.bytes_recv(),
            latency_ms,
            "Request completed"
        );
    }

    if stream.capture_enabled {
        let request = stream.request_capture.lock().unwrap_or_else(|e| e.into_inner());
        let response = stream.response_capture.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(
            stream_id = %stream.id,
            request_bytes = request.len(),
            response_bytes = response.len(),
            "Captured stream traffic"
        );
    }
}

fn capture_bounded(buffer: &Mutex<Vec<u8>>, chunk: &[u8]) {
    let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
    let room = CAPTURE_LIMIT.saturating_sub(buffer.len());
    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

/// Pull method, path, and forwarded source address from the request head.
fn parse_request_head(stream: &LocalStream, chunk: &[u8]) {
    let head = String::from_utf8_lossy(&chunk[..chunk.len().min(4096)]);
    let mut lines = head.split("\r\n");

    let mut log = stream.log.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(request_line) = lines.next() {
        let mut parts = request_line.split_whitespace();
        if let (Some(method), Some(path)) = (parts.next(), parts.next()) {
            log.method = method.to_string();
            log.path = path.to_string();
        }
    }
    for line in lines {
        let Some((name, value)) = line.split_once(':') else { continue };
        if name.eq_ignore_ascii_case("x-forwarded-for") || name.eq_ignore_ascii_case("x-real-ip") {
            log.source_ip = value.trim().to_string();
            break;
        }
    }
}

/// Pull the status code out of the response head.
fn parse_response_status(stream: &LocalStream, chunk: &[u8]) {
    if !chunk.starts_with(b"HTTP/") {
        return;
    }
    let head = String::from_utf8_lossy(&chunk[..chunk.len().min(128)]);
    let status_line = head.split("\r\n").next().unwrap_or("");
    if let Some(code) = status_line.split_whitespace().nth(1) {
        if let Ok(status) = code.parse() {
            stream.log.lock().unwrap_or_else(|e| e.into_inner()).status = status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_stream() -> Arc<LocalStream> {
        let (data_tx, _data_rx) = mpsc::channel(STREAM_BUFFER);
        Arc::new(LocalStream {
            id: StreamId::generate(),
            data_tx,
            cancel: CancellationToken::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            started: Instant::now(),
            log: Mutex::new(AccessLog::default()),
            capture_enabled: true,
            request_capture: Mutex::new(Vec::new()),
            response_capture: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn request_head_parsing() {
        let stream = test_stream();
        parse_request_head(
            &stream,
            b"GET /api/v1/items?page=2 HTTP/1.1\r\nHost: localhost\r\nX-Forwarded-For: 10.1.2.3\r\n\r\n",
        );
        let log = stream.log.lock().unwrap();
        assert_eq!(log.method, "GET");
        assert_eq!(log.path, "/api/v1/items?page=2");
        assert_eq!(log.source_ip, "10.1.2.3");
    }

    #[tokio::test]
    async fn response_status_parsing() {
        let stream = test_stream();
        parse_response_status(&stream, b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert_eq!(stream.log.lock().unwrap().status, 404);

        let stream = test_stream();
        parse_response_status(&stream, b"not-http at all");
        assert_eq!(stream.log.lock().unwrap().status, 0);
    }

    #[tokio::test]
    async fn capture_respects_limit() {
        let stream = test_stream();
        capture_bounded(&stream.request_capture, &vec![0u8; CAPTURE_LIMIT + 100]);
        assert_eq!(stream.request_capture.lock().unwrap().len(), CAPTURE_LIMIT);

        capture_bounded(&stream.request_capture, b"more");
        assert_eq!(stream.request_capture.lock().unwrap().len(), CAPTURE_LIMIT);
    }
}
