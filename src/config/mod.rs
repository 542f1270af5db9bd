//! Configuration Module
//!
//! Handles gateway configuration loading and validation.

pub mod loader;
pub mod provider;
pub mod settings;

pub use loader::ConfigLoader;
pub use provider::{CredentialConfig, ProviderConfig};
pub use settings::{BreakerSettings, CacheSettings, DispatchSettings, QueueSettings};

use crate::error::{RelayError, Result};
use crate::limits::Quotas;
use crate::router::Credential;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Provider configurations keyed by provider id
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,

    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,

    /// Quotas applied to credential windows that set none
    #[serde(default)]
    pub default_quotas: Quotas,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,
}

impl GatewayConfig {
    /// Parse a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RelayError::Config(format!("Invalid configuration: {}", e)))
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(RelayError::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.backoff_multiplier < 1.0 || !self.breaker.backoff_multiplier.is_finite() {
            return Err(RelayError::Config(
                "breaker.backoff_multiplier must be a finite number >= 1".to_string(),
            ));
        }
        if self.breaker.max_recovery_timeout_secs < self.breaker.recovery_timeout_secs {
            return Err(RelayError::Config(
                "breaker.max_recovery_timeout_secs must not be below recovery_timeout_secs".to_string(),
            ));
        }
        if self.queue.max_workers == 0 {
            return Err(RelayError::Config("queue.max_workers must be at least 1".to_string()));
        }
        if self.queue.max_pending == 0 {
            return Err(RelayError::Config("queue.max_pending must be at least 1".to_string()));
        }
        if self.cache.enabled && (self.cache.max_entries == 0 || self.cache.max_bytes == 0) {
            return Err(RelayError::Config(
                "cache.max_entries and cache.max_bytes must be positive when the cache is enabled".to_string(),
            ));
        }
        if self.dispatch.attempt_timeout_ms == 0 {
            return Err(RelayError::Config(
                "dispatch.attempt_timeout_ms must be positive".to_string(),
            ));
        }

        for (id, provider) in &self.providers {
            if provider.base_url.trim().is_empty() {
                return Err(RelayError::Config(format!("Provider '{}' has an empty base_url", id)));
            }
            if !provider.cost_per_token.is_finite() || provider.cost_per_token < 0.0 {
                return Err(RelayError::Config(format!(
                    "Provider '{}' has an invalid cost_per_token",
                    id
                )));
            }
        }

        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.id.trim().is_empty() {
                return Err(RelayError::Config("Credential with an empty id".to_string()));
            }
            if !seen.insert(credential.id.as_str()) {
                return Err(RelayError::Config(format!(
                    "Duplicate credential id '{}'",
                    credential.id
                )));
            }
            if !self.providers.contains_key(&credential.provider) {
                return Err(RelayError::Config(format!(
                    "Credential '{}' references unknown provider '{}'",
                    credential.id, credential.provider
                )));
            }
            if credential.key.is_none() && credential.key_env.is_none() {
                return Err(RelayError::Config(format!(
                    "Credential '{}' needs either `key` or `key_env`",
                    credential.id
                )));
            }
        }

        Ok(())
    }

    /// Runtime credentials. Entries whose `key_env` is unset are skipped.
    pub fn build_credentials(&self, now: DateTime<Utc>) -> Vec<Credential> {
        self.credentials
            .iter()
            .filter_map(|entry| {
                let credential = entry.to_credential(&self.default_quotas, now);
                if credential.is_none() {
                    warn!(
                        credential = %entry.id,
                        key_env = entry.key_env.as_deref().unwrap_or(""),
                        "No secret available, credential skipped"
                    );
                }
                credential
            })
            .collect()
    }

    /// Merge another config into this one (later configs override earlier)
    pub fn merge(&mut self, other: GatewayConfig) {
        for (id, provider) in other.providers {
            self.providers.insert(id, provider);
        }

        for credential in other.credentials {
            match self.credentials.iter_mut().find(|c| c.id == credential.id) {
                Some(existing) => *existing = credential,
                None => self.credentials.push(credential),
            }
        }

        let defaults = GatewayConfig::default();
        if other.default_quotas != defaults.default_quotas {
            self.default_quotas = other.default_quotas;
        }
        if other.breaker != defaults.breaker {
            self.breaker = other.breaker;
        }
        if other.cache != defaults.cache {
            self.cache = other.cache;
        }
        if other.queue != defaults.queue {
            self.queue = other.queue;
        }
        if other.dispatch != defaults.dispatch {
            self.dispatch = other.dispatch;
        }
    }
}
