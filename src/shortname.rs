//! Short subdomain names for long archive addresses
//!
//! A short name is a fixed-length prefix of the address, normalised into a
//! valid host label. The first address to claim a short name keeps it for the
//! lifetime of the table; a later, different address with the same prefix is
//! rejected rather than silently taking the name over.

use crate::error::ShortNameError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Default number of address characters used for a short name
pub const DEFAULT_TOKEN_LEN: usize = 5;

/// Directory of short name -> full address mappings
pub struct ShortNameTable {
    entries: DashMap<String, String>,
    token_len: usize,
    /// Maximum number of entries, 0 for unbounded
    capacity: usize,
    /// Label that can never be handed out as a short name
    reserved: String,
    len: AtomicUsize,
}

impl ShortNameTable {
    pub fn new(token_len: usize, capacity: usize, reserved: impl Into<String>) -> Self {
        Self {
            entries: DashMap::new(),
            token_len: token_len.max(1),
            capacity,
            reserved: reserved.into().to_ascii_lowercase(),
            len: AtomicUsize::new(0),
        }
    }

    /// Derive the short name for an address without registering it
    pub fn token_for(&self, address: &str) -> String {
        address
            .chars()
            .take(self.token_len)
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// Register an address and return its short name.
    ///
    /// Registering the same address again returns the same short name.
    pub fn register(&self, address: &str) -> Result<String, ShortNameError> {
        if address.is_empty() {
            return Err(ShortNameError::EmptyAddress);
        }

        let token = self.token_for(address);
        if token == self.reserved {
            return Err(ShortNameError::Reserved(token));
        }

        match self.entries.entry(token.clone()) {
            Entry::Occupied(existing) => {
                if existing.get() != address {
                    return Err(ShortNameError::Collision {
                        token,
                        existing: existing.get().clone(),
                    });
                }
            }
            Entry::Vacant(slot) => {
                self.reserve_slot()?;
                slot.insert(address.to_string());
                debug!(token, address, "Registered short name");
            }
        }

        Ok(token)
    }

    /// Look up the address registered under a short name
    pub fn lookup(&self, token: &str) -> Option<String> {
        self.entries
            .get(&token.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reserve_slot(&self) -> Result<(), ShortNameError> {
        let capacity = self.capacity;
        self.len
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |len| {
                if capacity == 0 || len < capacity {
                    Some(len + 1)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|_| ShortNameError::Full { capacity })
    }
}

impl Default for ShortNameTable {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_LEN, 0, "dat")
    }
}
