//! In-memory resolver and sessions for unit tests

use crate::error::{full_body, ResolveError, SessionError};
use crate::resolver::Resolver;
use crate::session::{CanonicalKey, GatewayBody, OpenOptions, ResourceSession, SessionOpener};
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Deterministic 64-hex key for test number `n`
pub fn key(n: u8) -> CanonicalKey {
    CanonicalKey::new(format!("{:02x}", n).repeat(32))
}

#[derive(Default)]
struct MockState {
    open_delay: Duration,
    sync_delay: Duration,
    open_error: Option<String>,
    sync_error: Option<String>,
    opened: Mutex<Vec<CanonicalKey>>,
    closed: Mutex<Vec<CanonicalKey>>,
}

/// Session opener that records every open and close
#[derive(Clone, Default)]
pub struct MockOpener {
    state: Arc<MockState>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self) -> &mut MockState {
        Arc::get_mut(&mut self.state).expect("configure MockOpener before cloning it")
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.state_mut().open_delay = delay;
        self
    }

    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.state_mut().sync_delay = delay;
        self
    }

    pub fn failing_open(mut self, message: &str) -> Self {
        self.state_mut().open_error = Some(message.to_string());
        self
    }

    pub fn failing_sync(mut self, message: &str) -> Self {
        self.state_mut().sync_error = Some(message.to_string());
        self
    }

    pub fn open_count(&self) -> usize {
        self.state.opened.lock().len()
    }

    pub fn closed_keys(&self) -> Vec<CanonicalKey> {
        self.state.closed.lock().clone()
    }

    pub fn close_count(&self, key: &CanonicalKey) -> usize {
        self.state.closed.lock().iter().filter(|k| *k == key).count()
    }
}

impl SessionOpener for MockOpener {
    type Session = MockSession;

    async fn open(&self, _dir: &Path, options: OpenOptions) -> Result<MockSession, SessionError> {
        self.state.opened.lock().push(options.key.clone());
        if !self.state.open_delay.is_zero() {
            tokio::time::sleep(self.state.open_delay).await;
        }
        if let Some(message) = &self.state.open_error {
            return Err(SessionError::Open(message.clone()));
        }
        Ok(MockSession {
            key: options.key,
            state: Arc::clone(&self.state),
            joined: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Session that answers every request with its key and the request path
pub struct MockSession {
    key: CanonicalKey,
    state: Arc<MockState>,
    joined: AtomicBool,
    closed: AtomicBool,
}

impl MockSession {
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ResourceSession for MockSession {
    fn join_network(&self) {
        self.joined.store(true, Ordering::SeqCst);
    }

    async fn await_minimal_sync(&self) -> Result<(), SessionError> {
        if !self.state.sync_delay.is_zero() {
            tokio::time::sleep(self.state.sync_delay).await;
        }
        match &self.state.sync_error {
            Some(message) => Err(SessionError::Sync(message.clone())),
            None => Ok(()),
        }
    }

    async fn serve(&self, req: Request<GatewayBody>) -> Result<Response<GatewayBody>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Serve("session is closed".to_string()));
        }
        if req.uri().path() == "/fail" {
            return Err(SessionError::Serve("peer reset the connection".to_string()));
        }

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let proto = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| SessionError::Serve(e.to_string()))?
            .to_bytes();

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("x-session-key", self.key.as_str())
            .header("x-forwarded-proto", proto)
            .header("x-request-body-len", body.len())
            .body(full_body(format!("{} {}", self.key, path)))
            .expect("valid response builder"))
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.closed.lock().push(self.key.clone());
        Ok(())
    }
}

/// Resolver answering from a fixed table
#[derive(Clone, Default)]
pub struct MockResolver {
    answers: HashMap<String, Result<CanonicalKey, ResolveError>>,
    delay: Duration,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, key: CanonicalKey) -> Self {
        self.answers.insert(address.to_string(), Ok(key));
        self
    }

    pub fn failing(mut self, address: &str, error: ResolveError) -> Self {
        self.answers.insert(address.to_string(), Err(error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Resolver for MockResolver {
    async fn resolve(&self, address: &str) -> Result<CanonicalKey, ResolveError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answers
            .get(address)
            .cloned()
            .unwrap_or_else(|| Err(ResolveError::NotFound(address.to_string())))
    }
}
