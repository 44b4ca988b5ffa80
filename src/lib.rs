//! dat-gateway - An HTTP gateway to peer-to-peer archives
//!
//! This library provides a gateway that:
//! - Serves each archive on its own subdomain, named by a short token
//! - Registers short names through a sentinel subdomain and redirects to them
//! - Resolves human-readable names to archive keys
//! - Opens one session per archive on demand and shares it across requests
//! - Closes sessions that sit idle or fall out of a bounded LRU cache

pub mod cache;
pub mod config;
pub mod error;
pub mod peer;
pub mod pool;
pub mod resolver;
pub mod router;
pub mod server;
pub mod session;
pub mod shortname;

#[cfg(test)]
mod testing;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
