//! Breaker Registry
//!
//! Lazily creates one breaker per provider, or per credential when
//! `per_credential` is set.

use super::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::clock::SharedClock;
use dashmap::DashMap;
use std::sync::Arc;

/// All circuit breakers of a gateway
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: SharedClock,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Registry configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Key of the breaker guarding calls with this credential
    pub fn key_for(&self, provider_id: &str, credential_id: &str) -> String {
        if self.config.per_credential {
            format!("{}/{}", provider_id, credential_id)
        } else {
            provider_id.to_string()
        }
    }

    /// Breaker guarding calls with this credential, created on first use
    pub fn breaker_for(&self, provider_id: &str, credential_id: &str) -> Arc<CircuitBreaker> {
        let key = self.key_for(provider_id, credential_id);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key,
                    self.config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .value()
            .clone()
    }

    /// Existing breaker by key
    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| b.value().clone())
    }

    /// Provider health: the worst state among its breakers
    pub fn provider_state(&self, provider_id: &str) -> CircuitState {
        let prefix = format!("{}/", provider_id);
        let states: Vec<CircuitState> = self
            .breakers
            .iter()
            .filter(|e| e.key() == provider_id || e.key().starts_with(&prefix))
            .map(|e| e.value().state())
            .collect();

        if states.contains(&CircuitState::Open) {
            CircuitState::Open
        } else if states.contains(&CircuitState::HalfOpen) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }

    /// Snapshots of every breaker, sorted by key
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Reset one breaker (or, for a provider id with per-credential
    /// breakers, all of the provider's breakers). Returns how many were reset.
    pub fn reset(&self, key: &str) -> usize {
        let prefix = format!("{}/", key);
        let targets: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .filter(|e| e.key() == key || e.key().starts_with(&prefix))
            .map(|e| e.value().clone())
            .collect();
        for breaker in &targets {
            breaker.reset();
        }
        targets.len()
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}
