//! Connection pool for upstream peer connections
//!
//! Sessions talk to their peer over pooled HTTP connections so that a busy
//! archive does not pay a TCP handshake per request.

use crate::session::GatewayBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Headers that describe one connection and must not cross to the peer
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy of `headers` suitable for the peer.
///
/// Drops `Host` (the peer sees its own authority), the fixed hop-by-hop set
/// and any header named in `Connection`.
fn peer_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            **name != header::HOST && !is_hop_by_hop(name) && !listed.contains(*name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to peers
    pub total_requests: AtomicU64,
    /// Sync probes sent to peers
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per peer
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled HTTP clients for peer traffic
pub struct ConnectionPool {
    client: Client<HttpConnector, GatewayBody>,
    /// Separate client for sync probes, which carry no body
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `origin` (`host:port`), keeping its method, end-to-end headers
    /// and body. The request's path and query are used as-is.
    pub async fn send_request(
        &self,
        req: Request<GatewayBody>,
        origin: &str,
    ) -> Result<Response<GatewayBody>, PoolError> {
        let uri = format!(
            "http://{}{}",
            origin,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut peer_req = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *peer_req.headers_mut() = peer_headers(&parts.headers);

        self.stats.record_request();

        let response = self.client.request(peer_req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Check whether `GET origin/path` succeeds
    pub async fn probe(&self, origin: &str, path: &str) -> bool {
        let uri = format!("http://{}{}", origin, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header(header::CONNECTION, "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_probe();

        match self.probe_client.request(req).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(origin, path, error = %e, "Peer probe failed");
                false
            }
        }
    }
}
