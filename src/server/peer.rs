//! Cross-server request forwarding.
//!
//! When the registry says another server owns the tunnel, the original
//! request is replayed against that server's public proxy port as plain
//! HTTP. The marker header tells the receiving server to resolve locally
//! only, which makes forwarding loops impossible.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Uri};
use axum::response::Response;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::observability::metrics;
use crate::registry::TunnelRecord;
use crate::server::pages;

/// Marker set on forwarded requests; its presence suppresses re-forwarding.
pub const PROXY_MARKER_HEADER: &str = "x-tungo-proxy";

/// Diagnostic header naming the server that answered a forwarded request.
pub const PROXIED_BY_HEADER: &str = "x-tungo-proxied-by";

/// Deadline for one peer round trip.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled HTTP client for server-to-server forwarding.
pub struct PeerProxy {
    client: Client<HttpConnector, Body>,
}

impl Default for PeerProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerProxy {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(20)
            .pool_timer(hyper_util::rt::TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(HttpConnector::new());
        Self { client }
    }

    /// Forward a public request to the owning server and relay its response.
    pub async fn forward(
        &self,
        request: Request<Body>,
        record: &TunnelRecord,
        remote_addr: SocketAddr,
        original_host: &str,
    ) -> Response {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!(
            "http://{}:{}{}",
            record.server_host, record.proxy_port, path_and_query
        );
        let target_uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(target = %target, error = %e, "Invalid peer target URL");
                metrics::record_proxy_request("error", Instant::now());
                return pages::bad_gateway("Unable to forward your request to the target server.");
            }
        };

        tracing::info!(
            subdomain = %record.subdomain,
            target_server = %record.server_id,
            target = %target,
            "Forwarding request to owning server"
        );

        let (mut parts, body) = request.into_parts();
        parts.uri = target_uri;
        parts.headers.insert(
            "x-forwarded-for",
            HeaderValue::from_str(&remote_addr.to_string())
                .unwrap_or(HeaderValue::from_static("unknown")),
        );
        parts
            .headers
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));
        parts
            .headers
            .insert(PROXY_MARKER_HEADER, HeaderValue::from_static("true"));
        if let Ok(host) = HeaderValue::from_str(original_host) {
            parts.headers.insert("x-original-host", host);
        }
        let proxied = Request::from_parts(parts, body);

        let started = Instant::now();
        let result = tokio::time::timeout(PEER_TIMEOUT, self.client.request(proxied)).await;

        let upstream = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!(
                    subdomain = %record.subdomain,
                    target_server = %record.server_id,
                    error = %e,
                    "Peer request failed"
                );
                metrics::record_proxy_request("error", started);
                return pages::bad_gateway(
                    "Unable to forward your request to the target server. The remote tunnel server may be unavailable.",
                );
            }
            Err(_) => {
                tracing::error!(
                    subdomain = %record.subdomain,
                    target_server = %record.server_id,
                    "Peer request timed out"
                );
                metrics::record_proxy_request("error", started);
                return pages::bad_gateway("The remote tunnel server did not answer in time.");
            }
        };
        metrics::record_proxy_request("success", started);

        let status = upstream.status();
        let (parts, body) = upstream.into_parts();
        let mut response = Response::from_parts(parts, Body::new(body));
        if let Ok(value) = HeaderValue::from_str(&record.server_id) {
            response.headers_mut().insert(PROXIED_BY_HEADER, value);
        }

        tracing::debug!(
            subdomain = %record.subdomain,
            status = %status,
            target_server = %record.server_id,
            "Peer request completed"
        );
        response
    }
}
