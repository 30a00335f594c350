//! Public-side request router.
//!
//! # Responsibilities
//! - Match the Host header against the domain template
//! - Resolve the owning tunnel via registry, then local connection manager
//! - Enforce the per-tunnel password gate
//! - Drive one stream per request: init, marshal, await, parse, respond
//!
//! # Design Decisions
//! - The router is a small per-request state machine: await first chunk,
//!   accumulate until idle or end, parse, respond. Two timeouts bound it:
//!   a 5 s first-chunk window and a 30 s hard deadline; a 200 ms idle
//!   window detects end-of-response when the client keeps the socket open
//! - Responses that do not look like HTTP are passed through as plain text
//!   rather than rejected, for origins that speak raw bodies
//! - The stream is removed on every exit path, success or failure

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::validation::SUBDOMAIN_PLACEHOLDER;
use crate::config::ServerConfig;
use crate::protocol::{DataMessage, InitStreamMessage, Message, MessageType, StreamId, MAX_FRAME_LEN};
use crate::registry::Registry;
use crate::server::connections::{ClientConnection, ConnectionManager};
use crate::server::pages;
use crate::server::peer::{PeerProxy, PROXY_MARKER_HEADER};

/// Hard deadline for one tunneled request, measured from stream creation.
const HARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Window for the first response chunk.
const FIRST_CHUNK_WINDOW: Duration = Duration::from_secs(5);

/// Idle window after any chunk; expiry means the response is complete.
const IDLE_WINDOW: Duration = Duration::from_millis(200);

/// Advisory wait for the client to pick up the stream: 50 x 10 ms.
const STREAM_READY_ATTEMPTS: u32 = 50;
const STREAM_READY_DELAY: Duration = Duration::from_millis(10);

/// Shared state of the public proxy listener.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<dyn Registry>,
    pub conn_mgr: Arc<ConnectionManager>,
    pub peer: Arc<PeerProxy>,
}

/// Substitute the subdomain into the domain template.
pub fn render_domain(template: &str, sub_domain: &str) -> String {
    template.replace(SUBDOMAIN_PLACEHOLDER, sub_domain)
}

/// Substitute the rendered domain and proxy port into the public URL
/// template.
pub fn render_public_url(template: &str, domain: &str, port: u16) -> String {
    template
        .replace("{{ .domain }}", domain)
        .replace("{{ .port }}", &port.to_string())
}

/// Extract the subdomain from a public Host by matching the domain
/// template around its placeholder. Returns `None` when the host does not
/// match the template.
pub fn extract_sub_domain(host: &str, template: &str) -> Option<String> {
    let idx = template.find(SUBDOMAIN_PLACEHOLDER)?;
    let prefix = &template[..idx];
    let suffix = &template[idx + SUBDOMAIN_PLACEHOLDER.len()..];

    let rest = host.strip_prefix(prefix)?;
    let sub_domain = rest.strip_suffix(suffix)?;
    if sub_domain.is_empty() {
        return None;
    }
    Some(sub_domain.to_string())
}

/// Hex sha256 of a tunnel password, as stored in the auth cookie and the
/// registry record.
pub fn password_sha256_hex(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Main public proxy handler: every method, every path.
pub async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let host = match request_host(&request) {
        Some(host) => host,
        None => return pages::tunnel_not_found(),
    };
    let Some(sub_domain) = extract_sub_domain(&host, &state.config.domain) else {
        return pages::tunnel_not_found();
    };

    // A request already forwarded by a peer is resolved locally only;
    // re-forwarding would loop.
    let already_proxied = request.headers().contains_key(PROXY_MARKER_HEADER);
    if !already_proxied {
        match state.registry.get_tunnel(&sub_domain).await {
            Ok(record) if record.server_id != state.registry.server_id() => {
                tracing::info!(
                    subdomain = %sub_domain,
                    target_server = %record.server_id,
                    "Proxying request to remote server"
                );
                return state.peer.forward(request, &record, addr, &host).await;
            }
            Ok(_) => {}
            Err(e) => {
                // Miss or store trouble: fall through to the local
                // connection manager, which also covers the in-memory
                // variant and reconnects ahead of registry propagation.
                tracing::debug!(subdomain = %sub_domain, error = %e, "Registry lookup fell through");
            }
        }
    }

    let Some(connection) = state.conn_mgr.get_by_sub_domain(&sub_domain) else {
        return pages::tunnel_not_active();
    };

    if let Some(password) = connection.password.clone() {
        match check_password(request.headers(), &password, &sub_domain) {
            PasswordGate::CookieOk => {}
            PasswordGate::HeaderOk => return auth_acknowledgement(&password, &sub_domain),
            PasswordGate::HeaderWrong => {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"authenticated": false, "error": "invalid password"}"#,
                )
                    .into_response();
            }
            PasswordGate::Missing => return pages::password_prompt(),
        }
    }

    tunnel_request(&state, connection, request, addr, &sub_domain).await
}

fn request_host(request: &Request<Body>) -> Option<String> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())?;
    // Strip any port; the template matches the hostname only.
    Some(raw.split(':').next().unwrap_or(raw).to_string())
}

enum PasswordGate {
    CookieOk,
    HeaderOk,
    HeaderWrong,
    Missing,
}

fn check_password(headers: &HeaderMap, password: &str, sub_domain: &str) -> PasswordGate {
    if let Some(provided) = headers
        .get("x-tungo-password")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return if provided == password {
            PasswordGate::HeaderOk
        } else {
            PasswordGate::HeaderWrong
        };
    }

    let cookie_name = format!("tungo-auth-{}", sub_domain);
    if let Some(value) = cookie_value(headers, &cookie_name) {
        if value == password_sha256_hex(password) {
            return PasswordGate::CookieOk;
        }
    }
    PasswordGate::Missing
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(raw) = cookie_header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key == name {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Successful header authentication: set the auth cookie and acknowledge
/// without proxying; the browser reloads to fetch the content.
fn auth_acknowledgement(password: &str, sub_domain: &str) -> Response {
    let cookie = format!(
        "tungo-auth-{}={}; Path=/; Max-Age=86400; HttpOnly; SameSite=Lax",
        sub_domain,
        password_sha256_hex(password)
    );
    (
        StatusCode::OK,
        [
            (header::SET_COOKIE, cookie.as_str()),
            (header::CONTENT_TYPE, "application/json"),
        ],
        r#"{"authenticated": true}"#,
    )
        .into_response()
}

enum TunnelError {
    InitFailed(String),
    BadRequest(String),
    SendFailed(String),
    HardTimeout,
    NoResponse,
    ClosedEarly,
    ParseFailed,
}

async fn tunnel_request(
    state: &AppState,
    connection: Arc<ClientConnection>,
    request: Request<Body>,
    addr: SocketAddr,
    sub_domain: &str,
) -> Response {
    let stream_id = StreamId::generate();
    let (stream, data_rx) = connection.add_stream(stream_id.clone(), "http", &addr.to_string());

    tracing::debug!(
        stream_id = %stream_id,
        client_id = %connection.id,
        subdomain = %sub_domain,
        method = %request.method(),
        path = %request.uri().path(),
        "Handling tunneled request"
    );

    let result = run_stream(&connection, &stream_id, request, data_rx, &stream).await;

    // Exactly once, on every exit path.
    connection.remove_stream(&stream_id);

    match result {
        Ok(buffer) => build_public_response(&buffer, &connection, &stream_id, sub_domain),
        Err(TunnelError::InitFailed(reason)) | Err(TunnelError::SendFailed(reason)) => {
            tracing::warn!(stream_id = %stream_id, reason = %reason, "Tunnel send failed");
            pages::bad_gateway("Unable to deliver the request to the tunnel client.")
        }
        Err(TunnelError::BadRequest(reason)) => {
            tracing::warn!(stream_id = %stream_id, reason = %reason, "Unreadable public request");
            pages::bad_gateway("The request body could not be read.")
        }
        Err(TunnelError::HardTimeout) => {
            tracing::warn!(stream_id = %stream_id, "Tunneled request hit hard deadline");
            pages::gateway_timeout()
        }
        Err(TunnelError::NoResponse) => {
            tracing::warn!(stream_id = %stream_id, "No response data received");
            pages::bad_gateway("No response data received from the tunnel client.")
        }
        Err(TunnelError::ClosedEarly) => {
            tracing::warn!(stream_id = %stream_id, "Stream closed without response");
            pages::bad_gateway("The tunnel closed before a response arrived.")
        }
        Err(TunnelError::ParseFailed) => {
            tracing::error!(stream_id = %stream_id, "Failed to parse tunneled response");
            pages::bad_gateway("Invalid response from the tunnel client.")
        }
    }
}

async fn run_stream(
    connection: &ClientConnection,
    stream_id: &StreamId,
    request: Request<Body>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    stream: &crate::server::connections::Stream,
) -> Result<Vec<u8>, TunnelError> {
    let hard_deadline = Instant::now() + HARD_TIMEOUT;

    let init = InitStreamMessage {
        stream_id: stream_id.clone(),
        protocol: "http".to_string(),
    };
    let message = Message::with_data(MessageType::Init, Some(stream_id.clone()), &init)
        .map_err(|e| TunnelError::InitFailed(e.to_string()))?;
    connection
        .send_message(&message)
        .map_err(|e| TunnelError::InitFailed(e.to_string()))?;

    // Advisory: give the client a moment to pick up the stream, but proceed
    // regardless once the window lapses.
    let mut ready = false;
    for _ in 0..STREAM_READY_ATTEMPTS {
        if connection.get_stream(stream_id).is_some() {
            ready = true;
            break;
        }
        tokio::time::sleep(STREAM_READY_DELAY).await;
    }
    if !ready {
        tracing::warn!(stream_id = %stream_id, "Stream not ready after init");
    }

    let request_bytes = marshal_request(request).await?;
    let data = DataMessage { data: request_bytes };
    let message = Message::with_data(MessageType::Data, Some(stream_id.clone()), &data)
        .map_err(|e| TunnelError::SendFailed(e.to_string()))?;
    connection
        .send_message(&message)
        .map_err(|e| TunnelError::SendFailed(e.to_string()))?;

    collect_response(&mut data_rx, stream, hard_deadline).await
}

/// Serialize the public request as a canonical HTTP/1.1 message.
async fn marshal_request(request: Request<Body>) -> Result<Vec<u8>, TunnelError> {
    let (parts, body) = request.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_FRAME_LEN)
        .await
        .map_err(|e| TunnelError::BadRequest(e.to_string()))?;

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut buf = Vec::with_capacity(256 + body_bytes.len());
    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", parts.method, target).as_bytes());

    for (name, value) in parts.headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    if !parts.headers.contains_key(header::HOST) {
        buf.extend_from_slice(b"Host: localhost\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&body_bytes);

    Ok(buf)
}

async fn collect_response(
    data_rx: &mut mpsc::Receiver<Vec<u8>>,
    stream: &crate::server::connections::Stream,
    hard_deadline: Instant,
) -> Result<Vec<u8>, TunnelError> {
    let mut buffer: Vec<u8> = Vec::new();

    let idle = tokio::time::sleep(FIRST_CHUNK_WINDOW);
    tokio::pin!(idle);
    let hard = tokio::time::sleep_until(hard_deadline);
    tokio::pin!(hard);

    loop {
        // Biased: buffered chunks are drained before revocation or the idle
        // window is honored, so an `end` arriving right behind the last
        // chunk never truncates the response.
        tokio::select! {
            biased;
            chunk = data_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        tracing::debug!(
                            stream_id = %stream.id,
                            chunk_bytes = chunk.len(),
                            total_bytes = buffer.len(),
                            "Received response chunk"
                        );
                        buffer.extend_from_slice(&chunk);
                        if Instant::now() >= hard_deadline {
                            return Err(TunnelError::HardTimeout);
                        }
                        idle.as_mut().reset(Instant::now() + IDLE_WINDOW);
                    }
                    None => {
                        return if buffer.is_empty() {
                            Err(TunnelError::ClosedEarly)
                        } else {
                            Ok(buffer)
                        };
                    }
                }
            }
            _ = stream.revoked() => {
                return if buffer.is_empty() {
                    Err(TunnelError::ClosedEarly)
                } else {
                    Ok(buffer)
                };
            }
            _ = &mut idle => {
                return if buffer.is_empty() {
                    Err(TunnelError::NoResponse)
                } else {
                    Ok(buffer)
                };
            }
            _ = &mut hard => return Err(TunnelError::HardTimeout),
        }
    }
}

/// Hop-by-hop headers never copied from the tunneled response; the public
/// transport manages its own connection and framing.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

fn build_public_response(
    buffer: &[u8],
    connection: &ClientConnection,
    stream_id: &StreamId,
    sub_domain: &str,
) -> Response {
    // Legacy tolerance: a body that does not look like HTTP is returned
    // verbatim as text rather than failed.
    if buffer.len() < 12 || !buffer.starts_with(b"HTTP/") {
        tracing::warn!(
            stream_id = %stream_id,
            bytes = buffer.len(),
            "Response does not look like HTTP, returning as plain text"
        );
        let mut response = (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            buffer.to_vec(),
        )
            .into_response();
        add_diagnostics(response.headers_mut(), connection, stream_id, sub_domain);
        return response;
    }

    let (status, headers, body) = match parse_http_response(buffer) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(stream_id = %stream_id, error = %e, "Failed to parse HTTP response");
            return pages::bad_gateway("Invalid response from the tunnel client.");
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    add_diagnostics(response.headers_mut(), connection, stream_id, sub_domain);
    response
}

fn add_diagnostics(
    headers: &mut HeaderMap,
    connection: &ClientConnection,
    stream_id: &StreamId,
    sub_domain: &str,
) {
    let entries = [
        ("x-tungo-client-id", connection.id.to_string()),
        ("x-tungo-stream-id", stream_id.to_string()),
        ("x-tungo-subdomain", sub_domain.to_string()),
        ("x-tungo-protocol", "http".to_string()),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    if let Some(version) = &connection.client_version {
        if let Ok(value) = HeaderValue::from_str(version) {
            headers.insert(HeaderName::from_static("x-tungo-client-version"), value);
        }
    }
}

/// Error type for tunneled response parsing.
#[derive(Debug)]
pub enum ResponseParseError {
    Incomplete,
    Malformed(httparse::Error),
    BadStatus(u16),
}

impl std::fmt::Display for ResponseParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseParseError::Incomplete => write!(f, "response header section incomplete"),
            ResponseParseError::Malformed(e) => write!(f, "malformed response: {}", e),
            ResponseParseError::BadStatus(code) => write!(f, "invalid status code: {}", code),
        }
    }
}

impl std::error::Error for ResponseParseError {}

/// Parse an accumulated HTTP/1.1 response into status, headers, and a
/// decoded body. Chunked transfer coding is removed here so the body can be
/// re-framed by the public transport.
pub fn parse_http_response(
    data: &[u8],
) -> Result<(StatusCode, HeaderMap, Vec<u8>), ResponseParseError> {
    let mut header_storage = [httparse::EMPTY_HEADER; 100];
    let mut parsed = httparse::Response::new(&mut header_storage);

    let header_len = match parsed.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Err(ResponseParseError::Incomplete),
        Err(e) => return Err(ResponseParseError::Malformed(e)),
    };

    let code = parsed.code.ok_or(ResponseParseError::Incomplete)?;
    let status = StatusCode::from_u16(code).map_err(|_| ResponseParseError::BadStatus(code))?;

    let mut headers = HeaderMap::new();
    let mut chunked = false;
    for h in parsed.headers.iter() {
        let Ok(name) = HeaderName::from_bytes(h.name.as_bytes()) else { continue };
        let Ok(value) = HeaderValue::from_bytes(h.value) else { continue };
        if name == header::TRANSFER_ENCODING {
            if let Ok(v) = std::str::from_utf8(h.value) {
                chunked = v.to_ascii_lowercase().contains("chunked");
            }
        }
        headers.append(name, value);
    }

    let raw_body = &data[header_len..];
    let body = if chunked {
        dechunk(raw_body)
    } else {
        raw_body.to_vec()
    };

    Ok((status, headers, body))
}

/// Decode a chunked transfer-coded body. Truncated input yields whatever
/// chunks decoded cleanly.
fn dechunk(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len());
    loop {
        let Some(line_end) = data.windows(2).position(|w| w == b"\r\n") else { break };
        let size_line = &data[..line_end];
        let size_str = match std::str::from_utf8(size_line) {
            Ok(s) => s.split(';').next().unwrap_or("").trim(),
            Err(_) => break,
        };
        let Ok(size) = usize::from_str_radix(size_str, 16) else { break };
        if size == 0 {
            break;
        }
        let chunk_start = line_end + 2;
        let chunk_end = chunk_start + size;
        if chunk_end > data.len() {
            break;
        }
        body.extend_from_slice(&data[chunk_start..chunk_end]);
        // Skip the chunk's trailing CRLF when present.
        data = &data[usize::min(chunk_end + 2, data.len())..];
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_template_round_trip() {
        let template = "{{ .subdomain }}.localhost";
        assert_eq!(render_domain(template, "demo"), "demo.localhost");
        assert_eq!(
            extract_sub_domain("demo.localhost", template).as_deref(),
            Some("demo")
        );
        assert_eq!(extract_sub_domain("localhost", template), None);
        assert_eq!(extract_sub_domain("demo.other.host", template), None);

        let dashed = "{{ .subdomain }}-tungo.example.com";
        assert_eq!(
            extract_sub_domain("test-tungo.example.com", dashed).as_deref(),
            Some("test")
        );
    }

    #[test]
    fn public_url_rendering() {
        let url = render_public_url("http://{{ .domain }}:{{ .port }}", "demo.localhost", 8080);
        assert_eq!(url, "http://demo.localhost:8080");

        let url = render_public_url("https://{{ .domain }}", "demo.tunnel.dev", 443);
        assert_eq!(url, "https://demo.tunnel.dev");
    }

    #[test]
    fn parses_plain_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        let (status, headers, body) = parse_http_response(raw).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn parses_chunked_response() {
        let raw =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let (status, _, body) = parse_http_response(raw).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn rejects_garbage_headers() {
        assert!(parse_http_response(b"HTTP/1.1 9999 NOPE\r\n\r\n").is_err());
        assert!(matches!(
            parse_http_response(b"HTTP/1.1 200 OK\r\nincomplete"),
            Err(ResponseParseError::Incomplete)
        ));
    }

    #[test]
    fn password_hash_matches_known_value() {
        // sha256("letmein")
        assert_eq!(
            password_sha256_hex("letmein"),
            "1c8bfe8f801d79745c4631d09fff36c82aa37fc4cce4fc946683d7b336b63032"
        );
    }

    #[test]
    fn cookie_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("a=1; tungo-auth-demo=abc123; b=2"),
        );
        assert_eq!(
            cookie_value(&headers, "tungo-auth-demo").as_deref(),
            Some("abc123")
        );
        assert_eq!(cookie_value(&headers, "tungo-auth-other"), None);
    }

    #[test]
    fn password_gate_decisions() {
        let password = "letmein";
        let mut headers = HeaderMap::new();
        assert!(matches!(
            check_password(&headers, password, "secure"),
            PasswordGate::Missing
        ));

        headers.insert("x-tungo-password", HeaderValue::from_static("letmein"));
        assert!(matches!(
            check_password(&headers, password, "secure"),
            PasswordGate::HeaderOk
        ));

        headers.insert("x-tungo-password", HeaderValue::from_static("wrong"));
        assert!(matches!(
            check_password(&headers, password, "secure"),
            PasswordGate::HeaderWrong
        ));

        headers.remove("x-tungo-password");
        let cookie = format!("tungo-auth-secure={}", password_sha256_hex(password));
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());
        assert!(matches!(
            check_password(&headers, password, "secure"),
            PasswordGate::CookieOk
        ));
    }
}
