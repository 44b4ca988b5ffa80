//! Address resolution: human-readable names to canonical archive keys

use crate::error::ResolveError;
use crate::session::CanonicalKey;
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Length of a hex-encoded archive key
pub const KEY_HEX_LEN: usize = 64;

/// Turns an address into the canonical key of the archive it names
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, address: &str) -> impl Future<Output = Result<CanonicalKey, ResolveError>> + Send;
}

/// Check whether a string is a hex-encoded archive key
pub fn is_archive_key(s: &str) -> bool {
    s.len() == KEY_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Resolver backed by a static table of names.
///
/// Raw keys (optionally with a `dat://` or `http(s)://` scheme, a path and a
/// `+version` suffix) resolve to themselves. Anything else is looked up by
/// host name in the table.
#[derive(Debug, Clone, Default)]
pub struct NameResolver {
    names: HashMap<String, CanonicalKey>,
}

impl NameResolver {
    pub fn new(names: &HashMap<String, String>) -> Self {
        let names = names
            .iter()
            .map(|(name, key)| (name.to_ascii_lowercase(), CanonicalKey::new(key.to_ascii_lowercase())))
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn resolve_now(&self, address: &str) -> Result<CanonicalKey, ResolveError> {
        let host = host_part(address);

        if is_archive_key(host) {
            return Ok(CanonicalKey::new(host.to_ascii_lowercase()));
        }

        self.names
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(address.to_string()))
    }
}

impl Resolver for NameResolver {
    async fn resolve(&self, address: &str) -> Result<CanonicalKey, ResolveError> {
        let result = self.resolve_now(address);
        match &result {
            Ok(key) => debug!(address, key = %key, "Resolved address"),
            Err(e) => debug!(address, error = %e, "Address did not resolve"),
        }
        result
    }
}

/// Strip scheme, path and version suffix from an address
fn host_part(address: &str) -> &str {
    let rest = address.trim();
    let rest = rest.split_once("://").map(|(_, r)| r).unwrap_or(rest);
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.split('+').next().unwrap_or(rest)
}
