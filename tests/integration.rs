//! Integration tests for dat-gateway

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dat_gateway::cache::{CacheConfig, ResourceCache};
use dat_gateway::config::Config;
use dat_gateway::error::SessionError;
use dat_gateway::peer::{PeerConfig, PeerOpener};
use dat_gateway::pool::{ConnectionPool, PoolConfig};
use dat_gateway::resolver::NameResolver;
use dat_gateway::router::{GatewayRouter, RouterConfig};
use dat_gateway::server::GatewayServer;
use dat_gateway::session::{CanonicalKey, GatewayBody, OpenOptions, ResourceSession, SessionOpener};
use dat_gateway::shortname::ShortNameTable;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const ADDRESS: &str = "example.org";

fn archive_key() -> String {
    "0123456789abcdef".repeat(4)
}

fn body(text: impl Into<Bytes>) -> GatewayBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// Sessions that answer with their key and the target they were asked for
#[derive(Clone, Default)]
struct EchoOpener {
    fail_open: bool,
    closed: Arc<Mutex<Vec<CanonicalKey>>>,
}

struct EchoSession {
    key: CanonicalKey,
    closed: Arc<Mutex<Vec<CanonicalKey>>>,
}

impl SessionOpener for EchoOpener {
    type Session = EchoSession;

    async fn open(&self, _dir: &Path, options: OpenOptions) -> Result<EchoSession, SessionError> {
        if self.fail_open {
            return Err(SessionError::Open("storage unavailable".to_string()));
        }
        Ok(EchoSession {
            key: options.key,
            closed: Arc::clone(&self.closed),
        })
    }
}

impl ResourceSession for EchoSession {
    fn join_network(&self) {}

    async fn await_minimal_sync(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, SessionError> {
        let target = req.uri().path_and_query().map(|pq| pq.to_string()).unwrap_or_default();
        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(body(format!("{} {}", self.key, target)))
            .unwrap())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.lock().push(self.key.clone());
        Ok(())
    }
}

fn names() -> HashMap<String, String> {
    let mut names = HashMap::new();
    names.insert(ADDRESS.to_string(), archive_key());
    names
}

async fn start_gateway<O: SessionOpener>(opener: O) -> (GatewayServer<NameResolver, O>, u16) {
    let cache = ResourceCache::new(
        opener,
        CacheConfig {
            max: 4,
            max_age: Duration::from_secs(60),
            open_timeout: Duration::from_secs(5),
            ..CacheConfig::default()
        },
    );
    let router = GatewayRouter::new(
        NameResolver::new(&names()),
        cache,
        Arc::new(ShortNameTable::default()),
        RouterConfig::default(),
    );
    let server = GatewayServer::new(router);
    let addr = server.listen(0, "127.0.0.1").await.unwrap();
    (server, addr.port())
}

/// Send HTTP request with custom Host header
async fn http_get_with_host(port: u16, path: &str, host: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    response.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn response_body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

#[tokio::test]
async fn test_shorten_then_serve() {
    let opener = EchoOpener::default();
    let (server, port) = start_gateway(opener.clone()).await;

    let response = http_get_with_host(port, "/example.org/docs/index.html", "dat.gateway.test")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 302"), "{}", response);
    assert_eq!(
        header(&response, "location"),
        Some("http://examp.gateway.test/docs/index.html")
    );

    let response = http_get_with_host(port, "/docs/index.html", "examp.gateway.test")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert_eq!(
        response_body(&response),
        format!("{} /docs/index.html", archive_key())
    );

    server.close().await;
    assert_eq!(*opener.closed.lock(), vec![CanonicalKey::new(archive_key())]);
}

#[tokio::test]
async fn test_unregistered_short_name_is_not_found() {
    let (server, port) = start_gateway(EchoOpener::default()).await;

    let response = http_get_with_host(port, "/", "examp.gateway.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert_eq!(response_body(&response), "Not found");

    server.close().await;
}

#[tokio::test]
async fn test_unknown_name_is_not_found() {
    let (server, port) = start_gateway(EchoOpener::default()).await;

    let response = http_get_with_host(port, "/missing.example/", "dat.gateway.test")
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 302"), "{}", response);

    let response = http_get_with_host(port, "/", "missi.gateway.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);
    assert_eq!(response_body(&response), "Not found");

    server.close().await;
}

#[tokio::test]
async fn test_open_failure_is_server_error() {
    let opener = EchoOpener {
        fail_open: true,
        ..EchoOpener::default()
    };
    let (server, port) = start_gateway(opener).await;

    http_get_with_host(port, "/example.org/", "dat.gateway.test").await.unwrap();
    let response = http_get_with_host(port, "/", "examp.gateway.test").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 500"), "{}", response);
    assert_eq!(header(&response, "x-gateway-error"), Some("OPEN_FAILED"));
    let json: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(json["code"], "OPEN_FAILED");
    assert_eq!(json["status"], 500);

    server.close().await;
}

#[tokio::test]
async fn test_missing_address_is_bad_request() {
    let (server, port) = start_gateway(EchoOpener::default()).await;

    let response = http_get_with_host(port, "/", "dat.gateway.test").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);
    assert_eq!(header(&response, "x-gateway-error"), Some("MISSING_ADDRESS"));

    server.close().await;
}

#[tokio::test]
async fn test_raw_key_round_trip() {
    let (server, port) = start_gateway(EchoOpener::default()).await;

    let key = archive_key();
    let response = http_get_with_host(port, &format!("/{}/", key), "dat.gateway.test")
        .await
        .unwrap();
    assert_eq!(header(&response, "location"), Some("http://01234.gateway.test/"));

    let response = http_get_with_host(port, "/a?b=c", "01234.gateway.test").await.unwrap();
    assert_eq!(response_body(&response), format!("{} /a?b=c", key));

    server.close().await;
}

#[tokio::test]
async fn test_config_driven_gateway() {
    let config: Config = toml::from_str(&format!(
        "[server]\nsentinel = \"go\"\n\n[names]\n\"{}\" = \"{}\"\n",
        ADDRESS,
        archive_key()
    ))
    .unwrap();
    config.validate().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut cache_config = config.cache_config();
    cache_config.dir = dir.path().to_path_buf();

    let router = GatewayRouter::new(
        NameResolver::new(&config.names),
        ResourceCache::new(EchoOpener::default(), cache_config),
        Arc::new(config.short_name_table()),
        config.router_config(),
    );
    let server = GatewayServer::new(router);
    let port = server.listen(0, "127.0.0.1").await.unwrap().port();

    let response = http_get_with_host(port, "/example.org/", "go.gateway.test").await.unwrap();
    assert_eq!(header(&response, "location"), Some("http://examp.gateway.test/"));

    server.close().await;
}

/// Peer that serves every archive path with a fixed body
async fn spawn_peer() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let path = req.uri().path().to_string();
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(format!("peer {}", path)))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    origin
}

#[tokio::test]
async fn test_serve_through_peer() {
    let origin = spawn_peer().await;
    let dir = tempfile::tempdir().unwrap();

    let opener = PeerOpener::new(
        Arc::new(ConnectionPool::new(PoolConfig::default())),
        PeerConfig {
            origin,
            sync_path: "/".to_string(),
            sync_interval: Duration::from_millis(20),
        },
    );
    let cache = ResourceCache::new(
        opener,
        CacheConfig {
            dir: dir.path().to_path_buf(),
            ..CacheConfig::default()
        },
    );
    let router = GatewayRouter::new(
        NameResolver::new(&names()),
        cache,
        Arc::new(ShortNameTable::default()),
        RouterConfig::default(),
    );
    let server = GatewayServer::new(router);
    let port = server.listen(0, "127.0.0.1").await.unwrap().port();

    http_get_with_host(port, "/example.org/", "dat.gateway.test").await.unwrap();
    let response = http_get_with_host(port, "/readme.md", "examp.gateway.test").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert_eq!(response_body(&response), format!("peer /{}/readme.md", archive_key()));
    assert!(dir.path().join(archive_key()).is_dir());

    server.close().await;
    assert!(!dir.path().join(archive_key()).exists());
}
