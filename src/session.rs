//! Resource sessions and the keys that identify them
//!
//! A session is the long-lived handle for one archive. Opening one is
//! expensive (storage setup, joining the swarm, waiting for metadata), which
//! is why the gateway keeps them in a [`ResourceCache`](crate::cache::ResourceCache)
//! instead of opening one per request.

use crate::error::SessionError;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::{Request, Response};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::Path;

/// Body type flowing into and out of sessions
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Resolver-produced identifier for an archive, used as the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Options passed to [`SessionOpener::open`]
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Archive to open
    pub key: CanonicalKey,
}

/// A live connection to one archive that can service HTTP exchanges.
///
/// Only the cache closes sessions, and it does so exactly once.
pub trait ResourceSession: Send + Sync + 'static {
    /// Start announcing and replicating on the network
    fn join_network(&self);

    /// Resolve once the archive metadata is usable (at least one sync)
    fn await_minimal_sync(&self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Service one request/response exchange
    fn serve(
        &self,
        req: Request<GatewayBody>,
    ) -> impl Future<Output = Result<Response<GatewayBody>, SessionError>> + Send;

    /// Release the session and its storage
    fn close(&self) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Constructs sessions for canonical keys
pub trait SessionOpener: Send + Sync + 'static {
    type Session: ResourceSession;

    fn open(
        &self,
        dir: &Path,
        options: OpenOptions,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_display() {
        let key = CanonicalKey::new("ab".repeat(32));
        assert_eq!(key.to_string(), "ab".repeat(32));
        assert_eq!(key.as_str().len(), 64);
    }

    #[test]
    fn test_canonical_key_serializes_as_string() {
        let key = CanonicalKey::new("deadbeef");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"deadbeef\"");
    }
}
