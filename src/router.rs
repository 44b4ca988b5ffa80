//! Subdomain routing in front of the session cache
//!
//! Two kinds of request reach the gateway:
//!
//! - `<sentinel>.<domain>/<address>/<rest>`: register a short name for the
//!   address and redirect to `<short>.<domain>/<rest>`.
//! - `<short>.<domain>/<path>`: look up the address behind the short name,
//!   resolve it to a key, acquire that session and let it serve `/<path>`.

use crate::cache::{ResourceCache, SessionLease};
use crate::error::GatewayError;
use crate::resolver::Resolver;
use crate::session::{GatewayBody, ResourceSession, SessionOpener};
use crate::shortname::ShortNameTable;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length in DNS
const MAX_HOSTNAME_LEN: usize = 253;

/// Routing settings
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Subdomain label meaning "shorten this address"
    pub sentinel: String,
    /// Bound on address resolution
    pub resolve_timeout: Duration,
    /// Bound on a session serving one request
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sentinel: "dat".to_string(),
            resolve_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP request handler for the gateway
pub struct GatewayRouter<R: Resolver, O: SessionOpener> {
    resolver: R,
    cache: Arc<ResourceCache<O>>,
    names: Arc<ShortNameTable>,
    config: RouterConfig,
}

impl<R: Resolver, O: SessionOpener> GatewayRouter<R, O> {
    pub fn new(
        resolver: R,
        cache: Arc<ResourceCache<O>>,
        names: Arc<ShortNameTable>,
        config: RouterConfig,
    ) -> Self {
        Self {
            resolver,
            cache,
            names,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache<O>> {
        &self.cache
    }

    pub fn names(&self) -> &Arc<ShortNameTable> {
        &self.names
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Handle one inbound request. `encrypted` tells whether the client
    /// connection was TLS, which picks the redirect scheme.
    pub async fn handle(
        &self,
        req: Request<GatewayBody>,
        client_addr: SocketAddr,
        encrypted: bool,
    ) -> Response<GatewayBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let Some(host) = extract_host(&req) else {
            return error_response(GatewayError::MissingHost, &request_id);
        };
        let label = subdomain(&host).to_string();

        debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let result = if label == self.config.sentinel {
            self.shorten(&req, &host, &label, encrypted)
        } else {
            self.forward(req, &label, &host, client_addr, encrypted, &request_id)
                .await
        };

        match result {
            Ok(response) => response,
            Err(e) => error_response(e, &request_id),
        }
    }

    /// Register the address in the first path segment and redirect to its short name
    fn shorten(
        &self,
        req: &Request<GatewayBody>,
        host: &str,
        label: &str,
        encrypted: bool,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let mut segments = req.uri().path().split('/').skip(1);
        let address = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(GatewayError::MissingAddress)?;
        let rest = segments.collect::<Vec<_>>().join("/");

        let token = self.names.register(address)?;

        let scheme = if encrypted { "https" } else { "http" };
        let mut location = format!("{}://{}{}/{}", scheme, token, &host[label.len()..], rest);
        if let Some(query) = req.uri().query() {
            location.push('?');
            location.push_str(query);
        }

        info!(address, token, location, "Registered short name");

        Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, location)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder"))
    }

    /// Resolve the short name, acquire the session and let it serve the request
    async fn forward(
        &self,
        req: Request<GatewayBody>,
        token: &str,
        host: &str,
        client_addr: SocketAddr,
        encrypted: bool,
        request_id: &str,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let address = self
            .names
            .lookup(token)
            .ok_or_else(|| GatewayError::UnknownShortName(token.to_string()))?;

        let resolve_timeout = self.config.resolve_timeout;
        let key = tokio::time::timeout(resolve_timeout, self.resolver.resolve(&address))
            .await
            .map_err(|_| GatewayError::ResolveTimeout {
                address: address.clone(),
                after: resolve_timeout,
            })??;

        let session = self.cache.acquire(&key).await?;

        let req = rewrite_request(req, host, client_addr, encrypted, request_id);
        debug!(token, key = %key, uri = %req.uri(), request_id, "Forwarding request to session");

        let request_timeout = self.config.request_timeout;
        let served = tokio::time::timeout(request_timeout, session.serve(req)).await;
        match served {
            Ok(Ok(response)) => Ok(response.map(|body| LeasedBody::new(body, session).boxed())),
            Ok(Err(e)) => Err(GatewayError::Serve(e)),
            Err(_) => Err(GatewayError::ServeTimeout(request_timeout)),
        }
    }
}

/// Response body that holds its session lease until the body is finished,
/// so an evicted session is not closed mid-response
struct LeasedBody<S: ResourceSession> {
    inner: GatewayBody,
    lease: Option<SessionLease<S>>,
}

impl<S: ResourceSession> LeasedBody<S> {
    fn new(inner: GatewayBody, lease: SessionLease<S>) -> Self {
        Self {
            inner,
            lease: Some(lease),
        }
    }
}

impl<S: ResourceSession> Body for LeasedBody<S> {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let frame = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(None) = frame {
            this.lease.take();
        }
        frame
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn error_response(error: GatewayError, request_id: &str) -> Response<GatewayBody> {
    let status = error.code().status_code();
    if status.is_server_error() {
        warn!(request_id, status = status.as_u16(), error = %error, "Request failed");
    } else {
        info!(request_id, status = status.as_u16(), error = %error, "Request rejected");
    }
    error.to_response()
}

/// Point the request at the session: origin-form target, proxy headers set.
///
/// X-Forwarded-* headers are overwritten rather than appended so clients
/// cannot spoof them.
fn rewrite_request(
    req: Request<GatewayBody>,
    host: &str,
    client_addr: SocketAddr,
    encrypted: bool,
    request_id: &str,
) -> Request<GatewayBody> {
    let (mut parts, body) = req.into_parts();

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or("/");
    parts.uri = target.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));

    let headers = &mut parts.headers;
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(X_FORWARDED_HOST, value);
    }
    let proto = if encrypted { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    Request::from_parts(parts, body)
}

/// Host (with port, if any) from the Host header or an absolute-form URI,
/// lowercased and validated
fn extract_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))?;

    let (hostname, port) = match raw.split_once(':') {
        Some((hostname, port)) => (hostname, Some(port)),
        None => (raw.as_str(), None),
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; this also keeps hostnames out of log injection
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
    }

    Some(raw.to_lowercase())
}

/// First label of a host
fn subdomain(host: &str) -> &str {
    let hostname = host.split(':').next().unwrap_or(host);
    hostname.split('.').next().unwrap_or(hostname)
}
