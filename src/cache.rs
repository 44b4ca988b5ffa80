//! Bounded cache of open resource sessions
//!
//! Sessions are expensive to open, so the cache keeps a bounded number of
//! them alive and makes sure each key is opened at most once at a time:
//! concurrent callers for the same key share a single open attempt and all
//! observe its outcome.
//!
//! Entries are bounded by count (least recently used goes first) and by idle
//! age. Eviction happens eagerly on acquisition and insertion; there is no
//! background sweeper.
//!
//! # Leases
//!
//! [`ResourceCache::acquire`] hands out a [`SessionLease`]. An evicted entry
//! leaves the index immediately, but its session is only closed once the last
//! lease on it is dropped. Either way the session is closed exactly once.

use crate::error::AcquireError;
use crate::session::{CanonicalKey, OpenOptions, ResourceSession, SessionOpener};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Configuration for the session cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Working storage handed to the session opener
    pub dir: PathBuf,
    /// Maximum number of cached sessions
    pub max: usize,
    /// Maximum idle time before a session is evicted
    pub max_age: Duration,
    /// Bound on open + join + minimal sync
    pub open_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./dat-gateway"),
            max: 20,
            max_age: Duration::from_secs(600),
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for cache activity
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    opens: AtomicU64,
    open_failures: AtomicU64,
    evictions: AtomicU64,
    disposals: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_disposal(&self) {
        self.disposals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of open attempts started
    pub fn get_opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn get_open_failures(&self) -> u64 {
        self.open_failures.load(Ordering::Relaxed)
    }

    /// Entries removed by the count or age bound
    pub fn get_evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Sessions closed by the cache
    pub fn get_disposals(&self) -> u64 {
        self.disposals.load(Ordering::Relaxed)
    }
}

/// A session owned by the cache
struct CachedEntry<S> {
    key: CanonicalKey,
    session: S,
    last_access: Mutex<Instant>,
    /// Outstanding leases
    active: AtomicUsize,
    /// Removed from the index
    evicted: AtomicBool,
    /// Set by whoever wins the right to close the session
    disposed: AtomicBool,
    stats: Arc<CacheStats>,
}

impl<S: ResourceSession> CachedEntry<S> {
    fn new(key: CanonicalKey, session: S, stats: Arc<CacheStats>) -> Self {
        Self {
            key,
            session,
            last_access: Mutex::new(Instant::now()),
            active: AtomicUsize::new(0),
            evicted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            stats,
        }
    }

    fn idle(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Must only be called while the entry is in the index and the index lock is
    /// held, or while another lease on the entry is alive
    fn lease(self: &Arc<Self>) -> SessionLease<S> {
        self.active.fetch_add(1, Ordering::SeqCst);
        SessionLease {
            entry: Arc::clone(self),
        }
    }

    /// Mark the entry as evicted. Returns true if the caller must dispose it now.
    fn retire(&self) -> bool {
        self.evicted.store(true, Ordering::SeqCst);
        self.active.load(Ordering::SeqCst) == 0 && self.claim_disposal()
    }

    /// Drop one lease. Returns true if the caller must dispose the entry.
    fn release(&self) -> bool {
        let previous = self.active.fetch_sub(1, Ordering::SeqCst);
        previous == 1 && self.evicted.load(Ordering::SeqCst) && self.claim_disposal()
    }

    fn claim_disposal(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }

    async fn dispose(&self) {
        debug!(key = %self.key, "Disposing of session");
        if let Err(e) = self.session.close().await {
            warn!(key = %self.key, error = %e, "Failed to close session");
        }
        self.stats.record_disposal();
    }
}

/// Shared use of a cached session.
///
/// Keeps the session open while held, even if the cache evicts it meanwhile.
pub struct SessionLease<S: ResourceSession> {
    entry: Arc<CachedEntry<S>>,
}

impl<S: ResourceSession> SessionLease<S> {
    pub fn key(&self) -> &CanonicalKey {
        &self.entry.key
    }
}

impl<S: ResourceSession> Clone for SessionLease<S> {
    fn clone(&self) -> Self {
        self.entry.lease()
    }
}

impl<S: ResourceSession> std::fmt::Debug for SessionLease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("key", &self.entry.key)
            .field("active", &self.entry.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S: ResourceSession> Deref for SessionLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.entry.session
    }
}

impl<S: ResourceSession> Drop for SessionLease<S> {
    fn drop(&mut self) {
        if !self.entry.release() {
            return;
        }

        let entry = Arc::clone(&self.entry);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { entry.dispose().await });
            }
            Err(_) => {
                warn!(key = %entry.key, "No runtime available, session dropped without close");
            }
        }
    }
}

struct Index<S> {
    lru: LruCache<CanonicalKey, Arc<CachedEntry<S>>>,
    closed: bool,
}

impl<S: ResourceSession> Index<S> {
    /// Pop entries idle for longer than `max_age`, oldest first
    fn pop_expired(&mut self, max_age: Duration) -> Vec<Arc<CachedEntry<S>>> {
        let mut expired = Vec::new();
        while let Some((_, entry)) = self.lru.peek_lru() {
            if entry.idle() <= max_age {
                break;
            }
            if let Some((_, entry)) = self.lru.pop_lru() {
                expired.push(entry);
            }
        }
        expired
    }

    fn drain(&mut self) -> Vec<Arc<CachedEntry<S>>> {
        let mut drained = Vec::with_capacity(self.lru.len());
        while let Some((_, entry)) = self.lru.pop_lru() {
            drained.push(entry);
        }
        drained
    }
}

/// Outcome of an open attempt, shared by every caller waiting on it.
///
/// A successful open carries a lease taken when the entry was inserted, so
/// the new session stays open until each waiter has taken its own lease.
type OpenResult<S> = Result<Arc<SessionLease<S>>, AcquireError>;
type SharedOpen<S> = Shared<BoxFuture<'static, OpenResult<S>>>;

enum Slot<S: ResourceSession> {
    Ready(SessionLease<S>),
    Pending(SharedOpen<S>),
}

/// Bounded cache of open sessions with single-flight acquisition.
///
/// `ResourceCache` is used behind an `Arc`; [`new`](ResourceCache::new)
/// returns one, and [`acquire`](ResourceCache::acquire) needs `&Arc<Self>`
/// to hand the open attempt to a background task.
pub struct ResourceCache<O: SessionOpener> {
    opener: O,
    config: CacheConfig,
    index: Mutex<Index<O::Session>>,
    /// Open attempts in progress, one per key
    in_flight: DashMap<CanonicalKey, SharedOpen<O::Session>>,
    stats: Arc<CacheStats>,
}

impl<O: SessionOpener> ResourceCache<O> {
    pub fn new(opener: O, config: CacheConfig) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.max).unwrap_or(NonZeroUsize::MIN);
        info!(
            dir = %config.dir.display(),
            max = capacity.get(),
            max_age_secs = config.max_age.as_secs(),
            "Session cache initialized"
        );

        Arc::new(Self {
            opener,
            index: Mutex::new(Index {
                lru: LruCache::new(capacity),
                closed: false,
            }),
            in_flight: DashMap::new(),
            stats: Arc::new(CacheStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    pub fn len(&self) -> usize {
        self.index.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check for a cached entry without touching its recency
    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.index.lock().lru.contains(key)
    }

    /// Cached keys, most recently used first
    pub fn keys(&self) -> Vec<CanonicalKey> {
        self.index.lock().lru.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.index.lock().closed
    }

    /// Get the session for `key`, opening it if needed.
    ///
    /// Concurrent calls for a key that is being opened wait for that open
    /// instead of starting another one.
    pub async fn acquire(self: &Arc<Self>, key: &CanonicalKey) -> Result<SessionLease<O::Session>, AcquireError> {
        self.evict_expired().await;

        match self.join_or_open(key)? {
            Slot::Ready(lease) => {
                self.stats.record_hit();
                debug!(key = %key, "Session cache hit");
                Ok(lease)
            }
            Slot::Pending(open) => {
                self.stats.record_miss();
                let opened = open.await?;
                if self.is_closed() {
                    return Err(AcquireError::Closed);
                }
                Ok((*opened).clone())
            }
        }
    }

    /// Dispose every cached session. The cache stays usable.
    pub async fn reset(&self) {
        let drained = self.index.lock().drain();
        info!(count = drained.len(), "Resetting session cache");
        self.retire_all(drained).await;
    }

    /// Dispose every cached session and refuse further acquisitions
    pub async fn close(&self) {
        let drained = {
            let mut index = self.index.lock();
            index.closed = true;
            index.drain()
        };
        info!(count = drained.len(), "Closing session cache");
        self.retire_all(drained).await;
    }

    /// Evict entries that have been idle for longer than `max_age`
    pub async fn evict_expired(&self) {
        let expired = self.index.lock().pop_expired(self.config.max_age);
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "Evicting idle sessions");
        self.stats.record_evictions(expired.len());
        self.retire_all(expired).await;
    }

    fn lookup(&self, key: &CanonicalKey) -> Result<Option<SessionLease<O::Session>>, AcquireError> {
        let mut index = self.index.lock();
        if index.closed {
            return Err(AcquireError::Closed);
        }

        let max_age = self.config.max_age;
        match index.lru.get(key) {
            Some(entry) if entry.idle() <= max_age => {
                entry.touch();
                Ok(Some(entry.lease()))
            }
            // Expired entries are replaced (and retired) when the reopen lands
            _ => Ok(None),
        }
    }

    fn join_or_open(self: &Arc<Self>, key: &CanonicalKey) -> Result<Slot<O::Session>, AcquireError> {
        if let Some(lease) = self.lookup(key)? {
            return Ok(Slot::Ready(lease));
        }

        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(open) => {
                debug!(key = %key, "Waiting for in-flight session open");
                Ok(Slot::Pending(open.get().clone()))
            }
            Entry::Vacant(slot) => {
                // The open task inserts into the index before leaving
                // `in_flight`, so a vacant slot means any finished open is
                // visible here.
                if let Some(lease) = self.lookup(key)? {
                    return Ok(Slot::Ready(lease));
                }
                let open = self.spawn_open(key.clone());
                slot.insert(open.clone());
                Ok(Slot::Pending(open))
            }
        }
    }

    fn spawn_open(self: &Arc<Self>, key: CanonicalKey) -> SharedOpen<O::Session> {
        self.stats.record_open();
        let cache = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move { cache.open_entry(task_key).await });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(AcquireError::Aborted {
                    key,
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn open_entry(self: Arc<Self>, key: CanonicalKey) -> OpenResult<O::Session> {
        let result = match self.open_session(&key).await {
            Ok(session) => self.insert(key.clone(), session).await,
            Err(e) => {
                self.stats.record_open_failure();
                warn!(key = %key, error = %e, "Failed to open session");
                Err(e)
            }
        };
        self.in_flight.remove(&key);
        result
    }

    /// Open, join and wait for the first sync, all within `open_timeout`
    async fn open_session(&self, key: &CanonicalKey) -> Result<O::Session, AcquireError> {
        let timeout = self.config.open_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let options = OpenOptions { key: key.clone() };

        debug!(key = %key, "Opening session");
        let session = match tokio::time::timeout_at(deadline, self.opener.open(&self.config.dir, options)).await {
            Ok(Ok(session)) => session,
            Ok(Err(cause)) => {
                return Err(AcquireError::Open {
                    key: key.clone(),
                    cause,
                })
            }
            Err(_) => {
                return Err(AcquireError::Timeout {
                    key: key.clone(),
                    after: timeout,
                })
            }
        };

        session.join_network();

        let error = match tokio::time::timeout_at(deadline, session.await_minimal_sync()).await {
            Ok(Ok(())) => {
                info!(key = %key, "Session ready");
                return Ok(session);
            }
            Ok(Err(cause)) => AcquireError::Open {
                key: key.clone(),
                cause,
            },
            Err(_) => AcquireError::Timeout {
                key: key.clone(),
                after: timeout,
            },
        };

        // Never handed out, so it is closed here rather than by disposal
        if let Err(e) = session.close().await {
            warn!(key = %key, error = %e, "Failed to close session after failed sync");
        }
        Err(error)
    }

    async fn insert(&self, key: CanonicalKey, session: O::Session) -> OpenResult<O::Session> {
        let entry = Arc::new(CachedEntry::new(key.clone(), session, Arc::clone(&self.stats)));

        let (displaced, handoff) = {
            let mut index = self.index.lock();
            if index.closed {
                (vec![Arc::clone(&entry)], None)
            } else {
                let mut displaced = index.pop_expired(self.config.max_age);
                if let Some((_, old)) = index.lru.push(key.clone(), Arc::clone(&entry)) {
                    displaced.push(old);
                }
                (displaced, Some(entry.lease()))
            }
        };

        let Some(handoff) = handoff else {
            debug!(key = %key, "Cache closed while opening, discarding session");
            self.retire_all(displaced).await;
            return Err(AcquireError::Closed);
        };

        if !displaced.is_empty() {
            debug!(key = %key, count = displaced.len(), "Evicting sessions to make room");
            self.stats.record_evictions(displaced.len());
            self.retire_all(displaced).await;
        }

        Ok(Arc::new(handoff))
    }

    async fn retire_all(&self, entries: Vec<Arc<CachedEntry<O::Session>>>) {
        let disposals = entries.into_iter().filter_map(|entry| {
            if entry.retire() {
                Some(async move { entry.dispose().await })
            } else {
                debug!(key = %entry.key, "Session in use, disposal deferred until released");
                None
            }
        });
        join_all(disposals).await;
    }
}
