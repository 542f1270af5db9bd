//! Runtime Settings
//!
//! Serializable knobs for the breaker, cache, queue and dispatcher. Durations
//! are plain seconds (or milliseconds where noted) in the file.

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::queue::QueueConfig;
use crate::router::Strategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub recovery_timeout_secs: u64,
    pub backoff_multiplier: f64,
    pub max_recovery_timeout_secs: u64,
    pub per_credential: bool,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            failure_window_secs: config.failure_window.as_secs(),
            recovery_timeout_secs: config.recovery_timeout.as_secs(),
            backoff_multiplier: config.backoff_multiplier,
            max_recovery_timeout_secs: config.max_recovery_timeout.as_secs(),
            per_credential: config.per_credential,
        }
    }
}

impl BreakerSettings {
    pub fn to_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            failure_window: Duration::from_secs(self.failure_window_secs),
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            backoff_multiplier: self.backoff_multiplier,
            max_recovery_timeout: Duration::from_secs(self.max_recovery_timeout_secs),
            per_credential: self.per_credential,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            enabled: config.enabled,
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            ttl_secs: config.default_ttl.as_secs(),
            sweep_interval_secs: config.sweep_interval.as_secs(),
        }
    }
}

impl CacheSettings {
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.enabled,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            default_ttl: Duration::from_secs(self.ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_workers: usize,
    pub max_pending: usize,
    pub result_ttl_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let config = QueueConfig::default();
        Self {
            max_workers: config.max_workers,
            max_pending: config.max_pending,
            result_ttl_secs: config.result_ttl.as_secs(),
        }
    }
}

impl QueueSettings {
    pub fn to_config(&self) -> QueueConfig {
        QueueConfig {
            max_workers: self.max_workers,
            max_pending: self.max_pending,
            result_ttl: Duration::from_secs(self.result_ttl_secs),
        }
    }
}

/// Dispatcher knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Requests estimated above this many tokens go to the overflow queue.
    /// `None` disables queueing.
    pub overflow_threshold_tokens: Option<u64>,

    /// Deadline of a single upstream attempt
    pub attempt_timeout_ms: u64,

    /// Strategy used when the request does not name one
    pub default_strategy: Strategy,

    /// Grace period during which a rotated-out secret stays valid
    pub rotation_grace_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            overflow_threshold_tokens: Some(32_000),
            attempt_timeout_ms: 60_000,
            default_strategy: Strategy::default(),
            rotation_grace_secs: 300,
        }
    }
}

impl DispatchSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn rotation_grace(&self) -> Duration {
        Duration::from_secs(self.rotation_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_sections_fill_defaults() {
        let settings: BreakerSettings =
            serde_json::from_str(r#"{"failure_threshold": 2}"#).unwrap();
        let config = settings.to_config();
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.recovery_timeout, BreakerConfig::default().recovery_timeout);
    }

    #[test]
    fn test_settings_mirror_runtime_defaults() {
        assert_eq!(BreakerSettings::default().to_config(), BreakerConfig::default());
        assert_eq!(CacheSettings::default().to_config(), CacheConfig::default());
        assert_eq!(QueueSettings::default().to_config(), QueueConfig::default());
    }

    #[test]
    fn test_dispatch_strategy_parses_alias() {
        let settings: DispatchSettings =
            serde_json::from_str(r#"{"default_strategy": "sticky_user", "overflow_threshold_tokens": null}"#)
                .unwrap();
        assert_eq!(settings.default_strategy, Strategy::Sticky);
        assert_eq!(settings.overflow_threshold_tokens, None);
        assert_eq!(settings.attempt_timeout(), Duration::from_secs(60));
    }
}
