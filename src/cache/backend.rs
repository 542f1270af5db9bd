//! Second-tier Cache Backends
//!
//! Optional store consulted after the in-process cache misses. Implementations
//! may be remote (Redis, memcached); only an in-memory one ships here.

use crate::api::{Completion, Fingerprint};
use crate::clock::{self, SharedClock};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt::Debug;
use std::time::Duration;

/// External cache tier keyed by request fingerprint
#[async_trait]
pub trait CacheBackend: Send + Sync + Debug {
    /// Fetch a live entry
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Completion>>;

    /// Store an entry for `ttl`
    async fn set(&self, fingerprint: &Fingerprint, completion: &Completion, ttl: Duration) -> Result<()>;

    /// Remove an entry. Returns whether it existed.
    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool>;
}

/// Process-local backend, mostly useful for tests and single-node setups
#[derive(Debug)]
pub struct MemoryCacheBackend {
    clock: SharedClock,
    entries: DashMap<Fingerprint, (Completion, DateTime<Utc>)>,
}

impl MemoryCacheBackend {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Completion>> {
        let now = self.clock.now();
        let live = self.entries.get(fingerprint).and_then(|entry| {
            let (completion, expires_at) = entry.value();
            (now < *expires_at).then(|| completion.clone())
        });
        if live.is_none() {
            self.entries.remove_if(fingerprint, |_, (_, expires_at)| now >= *expires_at);
        }
        Ok(live)
    }

    async fn set(&self, fingerprint: &Fingerprint, completion: &Completion, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + clock::to_chrono(ttl);
        self.entries
            .insert(fingerprint.clone(), (completion.clone(), expires_at));
        Ok(())
    }

    async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.entries.remove(fingerprint).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn completion() -> Completion {
        Completion {
            payload: serde_json::json!({"text": "hi"}),
            provider_id: "openai".to_string(),
            credential_id: "k1".to_string(),
            model: "gpt-4o".to_string(),
            tokens_used: 3,
            latency_ms: 10,
            status_code: 200,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_backend_expires_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let backend = MemoryCacheBackend::new(clock.clone());
        let fp = Fingerprint::from("abc");

        backend.set(&fp, &completion(), Duration::from_secs(5)).await.unwrap();
        assert!(backend.get(&fp).await.unwrap().is_some());

        clock.advance(Duration::from_secs(5));
        assert!(backend.get(&fp).await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_memory_backend_delete() {
        let backend = MemoryCacheBackend::new(Arc::new(ManualClock::starting_now()));
        let fp = Fingerprint::from("abc");

        backend.set(&fp, &completion(), Duration::from_secs(5)).await.unwrap();
        assert!(backend.delete(&fp).await.unwrap());
        assert!(!backend.delete(&fp).await.unwrap());
    }
}
