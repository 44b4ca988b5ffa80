use crate::cache::CacheConfig;
use crate::peer::PeerConfig;
use crate::pool::PoolConfig;
use crate::resolver::is_archive_key;
use crate::router::RouterConfig;
use crate::shortname::ShortNameTable;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variables that switch on diagnostic logging
pub const DIAGNOSTIC_ENV_VARS: [&str; 2] = ["DEBUG", "LOG"];

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and routing configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session cache configuration
    #[serde(default)]
    pub cache: CacheSettings,

    /// Upstream peer configuration
    #[serde(default)]
    pub peer: PeerSettings,

    /// Human-readable names and the archive keys they resolve to
    #[serde(default)]
    pub names: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Subdomain label that registers a short name (default: "dat")
    #[serde(default = "default_sentinel")]
    pub sentinel: String,

    /// Number of address characters in a short name (default: 5)
    #[serde(default = "default_short_token_len")]
    pub short_token_len: usize,

    /// Maximum number of short names, 0 for unbounded (default: 65536)
    #[serde(default = "default_short_name_capacity")]
    pub short_name_capacity: usize,

    /// Address resolution timeout in seconds (default: 10)
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,

    /// Request timeout in seconds (max time for a session to respond)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            sentinel: default_sentinel(),
            short_token_len: default_short_token_len(),
            short_name_capacity: default_short_name_capacity(),
            resolve_timeout_secs: default_resolve_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// Working storage for sessions
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Maximum number of open sessions (default: 20)
    #[serde(default = "default_cache_max")]
    pub max: usize,

    /// Idle time in seconds before a session is closed (default: 600)
    #[serde(default = "default_cache_max_age")]
    pub max_age_secs: u64,

    /// Time in seconds allowed for opening and first sync (default: 30)
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max: default_cache_max(),
            max_age_secs: default_cache_max_age(),
            open_timeout_secs: default_open_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeerSettings {
    /// Upstream peer as host:port
    #[serde(default = "default_peer_origin")]
    pub origin: String,

    /// Path probed under /<key> to detect the first sync
    #[serde(default = "default_sync_path")]
    pub sync_path: String,

    /// Delay between sync probes in milliseconds (default: 200)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// Maximum idle connections per peer (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            origin: default_peer_origin(),
            sync_path: default_sync_path(),
            sync_interval_ms: default_sync_interval(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_sentinel() -> String {
    "dat".to_string()
}

fn default_short_token_len() -> usize {
    5
}

fn default_short_name_capacity() -> usize {
    65536
}

fn default_resolve_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./dat-gateway")
}

fn default_cache_max() -> usize {
    20
}

fn default_cache_max_age() -> u64 {
    600 // 10 minutes
}

fn default_open_timeout() -> u64 {
    30
}

fn default_peer_origin() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sync_path() -> String {
    "/".to_string()
}

fn default_sync_interval() -> u64 {
    200
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn is_host_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.cache.max == 0 {
            errors.push("cache.max must be greater than 0".to_string());
        }
        if self.cache.max_age_secs == 0 {
            errors.push("cache.max_age_secs must be greater than 0".to_string());
        }
        if self.cache.open_timeout_secs == 0 {
            errors.push("cache.open_timeout_secs must be greater than 0".to_string());
        }
        if self.server.resolve_timeout_secs == 0 {
            errors.push("server.resolve_timeout_secs must be greater than 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if self.server.short_token_len == 0 {
            errors.push("server.short_token_len must be greater than 0".to_string());
        }
        if !is_host_label(&self.server.sentinel) {
            errors.push(format!(
                "server.sentinel '{}' must be a lowercase host label",
                self.server.sentinel
            ));
        }
        if !valid_origin(&self.peer.origin) {
            errors.push(format!("peer.origin '{}' must be host:port", self.peer.origin));
        }
        if !self.peer.sync_path.starts_with('/') {
            errors.push("peer.sync_path must start with '/'".to_string());
        }

        let mut names: Vec<_> = self.names.iter().collect();
        names.sort();
        for (name, key) in names {
            if !is_archive_key(key) {
                errors.push(format!("names.{}: '{}' is not a 64 character hex key", name, key));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            dir: self.cache.dir.clone(),
            max: self.cache.max,
            max_age: Duration::from_secs(self.cache.max_age_secs),
            open_timeout: Duration::from_secs(self.cache.open_timeout_secs),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            sentinel: self.server.sentinel.clone(),
            resolve_timeout: Duration::from_secs(self.server.resolve_timeout_secs),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.peer.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.peer.pool_idle_timeout_secs),
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            origin: self.peer.origin.clone(),
            sync_path: self.peer.sync_path.clone(),
            sync_interval: Duration::from_millis(self.peer.sync_interval_ms),
        }
    }

    pub fn short_name_table(&self) -> ShortNameTable {
        ShortNameTable::new(
            self.server.short_token_len,
            self.server.short_name_capacity,
            self.server.sentinel.clone(),
        )
    }
}

fn valid_origin(origin: &str) -> bool {
    match origin.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().map(|p| p > 0).unwrap_or(false),
        None => false,
    }
}

/// Whether DEBUG or LOG is set in the environment
pub fn diagnostics_enabled() -> bool {
    DIAGNOSTIC_ENV_VARS
        .iter()
        .any(|var| std::env::var_os(var).is_some_and(|v| !v.is_empty()))
}

/// Log directive for this crate given the diagnostics toggle
pub fn log_directive(diagnostics: bool) -> &'static str {
    if diagnostics {
        "dat_gateway=debug"
    } else {
        "dat_gateway=warn"
    }
}

/// Filter directives for the subscriber.
///
/// A non-empty `RUST_LOG` is used as given. Otherwise the crate logs at the
/// level picked by the diagnostics toggle.
pub fn log_filter(rust_log: Option<&str>, diagnostics: bool) -> String {
    match rust_log.map(str::trim).filter(|v| !v.is_empty()) {
        Some(directives) => directives.to_string(),
        None => log_directive(diagnostics).to_string(),
    }
}
