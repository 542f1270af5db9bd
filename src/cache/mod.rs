//! Response Cache
//!
//! Content-addressed completion cache with:
//! - LRU eviction bounded by entry count and total payload bytes
//! - TTL expiry, checked on read and by a periodic sweep
//! - single-flight: at most one computation per fingerprint at a time
//! - an optional second-tier [`CacheBackend`]

pub mod backend;

pub use backend::{CacheBackend, MemoryCacheBackend};

use crate::api::{Completion, Fingerprint, ResponseSource};
use crate::clock::{self, SharedClock};
use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Response cache configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Bypass the cache entirely
    pub enabled: bool,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total payload size
    pub max_bytes: usize,
    /// TTL used when the caller does not pass one
    pub default_ttl: Duration,
    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    completion: Arc<Completion>,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    size: usize,
}

#[derive(Debug)]
struct Store {
    lru: LruCache<Fingerprint, CacheEntry>,
    bytes: usize,
}

impl Store {
    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.lru.pop(fingerprint)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

/// Outcome broadcast by a single-flight leader
type FlightResult = Option<std::result::Result<Arc<Completion>, Arc<str>>>;

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
    backend_hits: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
    /// Callers that waited on another caller's computation
    pub coalesced: u64,
    /// Computations run by single-flight leaders
    pub computations: u64,
    pub backend_hits: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Point-in-time view of one entry
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub size: usize,
}

/// In-process response cache
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    clock: SharedClock,
    store: Mutex<Store>,
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<FlightResult>>>,
    backend: Option<Arc<dyn CacheBackend>>,
    counters: CacheCounters,
}

impl ResponseCache {
    /// Create a cache without a second tier
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            clock,
            store: Mutex::new(Store {
                lru: LruCache::new(capacity),
                bytes: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            backend: None,
            counters: CacheCounters::default(),
        }
    }

    /// Attach a second-tier backend
    pub fn with_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a live entry, dropping it if its TTL has elapsed
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Completion>> {
        if !self.config.enabled {
            return None;
        }
        let found = self.lookup(fingerprint, true);
        match found {
            Some(_) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                trace!(fingerprint = %fingerprint.short(), "Cache hit");
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Entry metadata without touching LRU order
    pub fn entry_info(&self, fingerprint: &Fingerprint) -> Option<CacheEntryInfo> {
        let store = self.store.lock();
        store.lru.peek(fingerprint).map(|e| CacheEntryInfo {
            stored_at: e.stored_at,
            expires_at: e.expires_at,
            last_access: e.last_access,
            size: e.size,
        })
    }

    /// Store a completion for `ttl`
    pub fn insert(&self, fingerprint: Fingerprint, completion: Arc<Completion>, ttl: Duration) {
        if !self.config.enabled || ttl.is_zero() {
            return;
        }
        let size = completion.size_bytes();
        if size > self.config.max_bytes {
            debug!(fingerprint = %fingerprint.short(), size, "Completion larger than cache, not stored");
            return;
        }

        let now = self.clock.now();
        let entry = CacheEntry {
            completion,
            stored_at: now,
            expires_at: now + clock::to_chrono(ttl),
            last_access: now,
            size,
        };

        let mut store = self.store.lock();
        let mut evicted = 0u64;

        store.remove(&fingerprint);
        if let Some((_, old)) = store.lru.push(fingerprint, entry) {
            store.bytes = store.bytes.saturating_sub(old.size);
            evicted += 1;
        }
        store.bytes += size;

        while store.bytes > self.config.max_bytes {
            match store.lru.pop_lru() {
                Some((_, old)) => {
                    store.bytes = store.bytes.saturating_sub(old.size);
                    evicted += 1;
                }
                None => break,
            }
        }
        drop(store);

        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            trace!(evicted, "Evicted least recently used entries");
        }
    }

    /// Drop an entry from this tier and the backend
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self.store.lock().remove(fingerprint).is_some();
        let mut removed_backend = false;
        if let Some(backend) = &self.backend {
            match backend.delete(fingerprint).await {
                Ok(existed) => removed_backend = existed,
                Err(e) => warn!(fingerprint = %fingerprint.short(), error = %e, "Cache backend delete failed"),
            }
        }
        removed || removed_backend
    }

    /// Drop every in-process entry
    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.lru.clear();
        store.bytes = 0;
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.store.lock();
        let expired: Vec<Fingerprint> = store
            .lru
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for fingerprint in &expired {
            store.remove(fingerprint);
        }
        drop(store);

        if !expired.is_empty() {
            self.counters
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(removed = expired.len(), "Swept expired cache entries");
        }
        expired.len()
    }

    /// Run [`ResponseCache::sweep_expired`] every `sweep_interval` until the
    /// cache is dropped or `shutdown` flips to true
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match weak.upgrade() {
                            Some(cache) => {
                                cache.sweep_expired();
                            }
                            None => break,
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            trace!("Cache sweeper stopped");
        })
    }

    /// Return the cached completion or run `compute`, making sure concurrent
    /// callers with the same fingerprint share one computation.
    ///
    /// Waiters whose leader fails receive
    /// [`RelayError::CacheComputationFailed`]; the leader receives its own
    /// error unchanged.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<(Arc<Completion>, ResponseSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Completion>>,
    {
        if !self.config.enabled {
            let completion = compute().await?;
            return Ok((Arc::new(completion), ResponseSource::Upstream));
        }

        if let Some(hit) = self.get(fingerprint) {
            return Ok((hit, ResponseSource::Cache));
        }

        let sender = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(fingerprint) {
                Some(rx) => Err(rx.clone()),
                None => {
                    // A leader may have finished between the miss above and
                    // taking this lock; it fills the cache before leaving.
                    if let Some(hit) = self.lookup(fingerprint, true) {
                        return Ok((hit, ResponseSource::Cache));
                    }
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(fingerprint.clone(), rx);
                    Ok(tx)
                }
            }
        };

        match sender {
            Ok(tx) => self.lead(fingerprint, ttl, tx, compute).await,
            Err(rx) => self.follow(fingerprint, rx).await,
        }
    }

    async fn lead<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        tx: watch::Sender<FlightResult>,
        compute: F,
    ) -> Result<(Arc<Completion>, ResponseSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Completion>>,
    {
        let guard = FlightGuard {
            cache: self,
            fingerprint,
            tx: Some(tx),
        };

        if let Some(backend) = &self.backend {
            match backend.get(fingerprint).await {
                Ok(Some(completion)) => {
                    self.counters.backend_hits.fetch_add(1, Ordering::Relaxed);
                    let completion = Arc::new(completion);
                    self.insert(fingerprint.clone(), completion.clone(), ttl);
                    guard.complete(Ok(completion.clone()));
                    debug!(fingerprint = %fingerprint.short(), "Cache backend hit");
                    return Ok((completion, ResponseSource::Cache));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(fingerprint = %fingerprint.short(), error = %e, "Cache backend lookup failed");
                }
            }
        }

        self.counters.computations.fetch_add(1, Ordering::Relaxed);
        match compute().await {
            Ok(completion) => {
                let completion = Arc::new(completion);
                self.insert(fingerprint.clone(), completion.clone(), ttl);
                if let Some(backend) = &self.backend {
                    if let Err(e) = backend.set(fingerprint, &completion, ttl).await {
                        warn!(fingerprint = %fingerprint.short(), error = %e, "Cache backend store failed");
                    }
                }
                guard.complete(Ok(completion.clone()));
                Ok((completion, ResponseSource::Upstream))
            }
            Err(e) => {
                guard.complete(Err(Arc::from(e.to_string())));
                Err(e)
            }
        }
    }

    async fn follow(
        &self,
        fingerprint: &Fingerprint,
        mut rx: watch::Receiver<FlightResult>,
    ) -> Result<(Arc<Completion>, ResponseSource)> {
        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint.short(), "Waiting on in-flight computation");

        let outcome = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(Ok(completion)) => Ok((completion, ResponseSource::Coalesced)),
            Some(Err(reason)) => Err(RelayError::CacheComputationFailed {
                fingerprint: fingerprint.to_string(),
                reason: reason.to_string(),
            }),
            None => Err(RelayError::CacheComputationFailed {
                fingerprint: fingerprint.to_string(),
                reason: "computation abandoned".to_string(),
            }),
        }
    }

    fn lookup(&self, fingerprint: &Fingerprint, touch: bool) -> Option<Arc<Completion>> {
        let now = self.clock.now();
        let mut store = self.store.lock();

        let expired = match store.lru.peek(fingerprint) {
            Some(entry) => now >= entry.expires_at,
            None => return None,
        };
        if expired {
            store.remove(fingerprint);
            drop(store);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if touch {
            let entry = store.lru.get_mut(fingerprint)?;
            entry.last_access = now;
            Some(entry.completion.clone())
        } else {
            store.lru.peek(fingerprint).map(|e| e.completion.clone())
        }
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let store = self.store.lock();
            (store.lru.len(), store.bytes)
        };
        CacheStats {
            entries,
            bytes,
            in_flight: self.in_flight.lock().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            computations: self.counters.computations.load(Ordering::Relaxed),
            backend_hits: self.counters.backend_hits.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Owned by the single-flight leader. Removes the in-flight entry when the
/// leader finishes or its future is dropped; waiters of a dropped leader see
/// the channel close.
struct FlightGuard<'a> {
    cache: &'a ResponseCache,
    fingerprint: &'a Fingerprint,
    tx: Option<watch::Sender<FlightResult>>,
}

impl FlightGuard<'_> {
    fn complete(mut self, result: std::result::Result<Arc<Completion>, Arc<str>>) {
        self.cache.in_flight.lock().remove(self.fingerprint);
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.cache.in_flight.lock().remove(self.fingerprint);
            warn!(fingerprint = %self.fingerprint.short(), "In-flight computation abandoned");
        }
    }
}
