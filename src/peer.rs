//! Sessions backed by an upstream peer over HTTP
//!
//! A [`PeerSession`] serves an archive by forwarding each exchange to a peer
//! that exposes archives as `/<key>/<path>`. Opening a session sets up its
//! temporary working storage; the session counts as synced once the peer
//! answers for the archive.

use crate::error::SessionError;
use crate::pool::ConnectionPool;
use crate::session::{CanonicalKey, GatewayBody, OpenOptions, ResourceSession, SessionOpener};
use hyper::{Request, Response, Uri};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upstream peer settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer origin as `host:port`
    pub origin: String,
    /// Path probed under `/<key>` to detect the first sync
    pub sync_path: String,
    /// Delay between sync probes
    pub sync_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            origin: "127.0.0.1:8080".to_string(),
            sync_path: "/".to_string(),
            sync_interval: Duration::from_millis(200),
        }
    }
}

/// Opens [`PeerSession`]s that share one connection pool
pub struct PeerOpener {
    pool: Arc<ConnectionPool>,
    config: PeerConfig,
}

impl PeerOpener {
    pub fn new(pool: Arc<ConnectionPool>, config: PeerConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl SessionOpener for PeerOpener {
    type Session = PeerSession;

    async fn open(&self, dir: &Path, options: OpenOptions) -> Result<PeerSession, SessionError> {
        let storage = dir.join(options.key.as_str());
        tokio::fs::create_dir_all(&storage).await.map_err(|e| {
            SessionError::Open(format!("failed to create storage {}: {}", storage.display(), e))
        })?;

        debug!(key = %options.key, storage = %storage.display(), "Session storage ready");

        Ok(PeerSession {
            key: options.key,
            storage,
            pool: Arc::clone(&self.pool),
            config: self.config.clone(),
            joined: AtomicBool::new(false),
        })
    }
}

/// One archive served through the peer
pub struct PeerSession {
    key: CanonicalKey,
    storage: PathBuf,
    pool: Arc<ConnectionPool>,
    config: PeerConfig,
    joined: AtomicBool,
}

impl PeerSession {
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    pub fn storage(&self) -> &Path {
        &self.storage
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Peer-side target for a gateway request target
    fn peer_target(&self, uri: &Uri) -> String {
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("/{}{}", self.key, target)
    }
}

impl ResourceSession for PeerSession {
    fn join_network(&self) {
        if !self.joined.swap(true, Ordering::SeqCst) {
            info!(key = %self.key, origin = %self.config.origin, "Joined network");
        }
    }

    async fn await_minimal_sync(&self) -> Result<(), SessionError> {
        if !self.is_joined() {
            return Err(SessionError::Sync("session has not joined the network".to_string()));
        }

        let path = format!("/{}{}", self.key, self.config.sync_path);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.pool.probe(&self.config.origin, &path).await {
                debug!(key = %self.key, attempts, "Metadata synced");
                return Ok(());
            }
            tokio::time::sleep(self.config.sync_interval).await;
        }
    }

    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, SessionError> {
        let (mut parts, body) = req.into_parts();
        let target = self.peer_target(&parts.uri);
        parts.uri = target
            .parse()
            .map_err(|e| SessionError::Serve(format!("invalid target {}: {}", target, e)))?;

        self.pool
            .send_request(Request::from_parts(parts, body), &self.config.origin)
            .await
            .map_err(|e| SessionError::Serve(e.to_string()))
    }

    async fn close(&self) -> Result<(), SessionError> {
        debug!(key = %self.key, storage = %self.storage.display(), "Closing session");
        match tokio::fs::remove_dir_all(&self.storage).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to remove session storage");
                Err(SessionError::Close(e.to_string()))
            }
        }
    }
}
