//! Keyrelay Error Types
//!
//! One taxonomy for every failure the dispatch core can report.

use std::time::Duration;
use thiserror::Error;

/// Main error type for keyrelay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration errors (invalid JSON, unknown provider references, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Provider not found in the pool
    #[error("Provider '{0}' not found. Add it to the `providers` section of keyrelay.json")]
    ProviderNotFound(String),

    /// Credential not found in the pool
    #[error("Credential '{0}' not found")]
    CredentialNotFound(String),

    /// A credential with this id already exists
    #[error("Credential '{0}' already exists")]
    DuplicateCredential(String),

    /// No credential survived static filtering (status, permissions, model)
    #[error("No available credential: {reason}")]
    EmptyPool { reason: String },

    /// Provider (or credential) breaker is rejecting calls
    #[error("Circuit open for '{target}'{}", retry_suffix(.retry_after))]
    CircuitOpen {
        target: String,
        retry_after: Option<Duration>,
    },

    /// Local quota for a credential is used up
    #[error("Rate limit exceeded for credential '{credential}'{}", retry_suffix_exact(.retry_after))]
    RateLimitExceeded {
        credential: String,
        retry_after: Duration,
    },

    /// The upstream call itself failed
    #[error("Upstream '{provider}' failed{}: {message}", status_suffix(.status))]
    Upstream {
        provider: String,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Upstream attempt exceeded its deadline
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Every candidate was tried or skipped without success
    #[error("All providers exhausted after {attempts} attempt(s){}", retry_suffix(.retry_after))]
    AllProvidersExhausted {
        attempts: usize,
        retry_after: Option<Duration>,
    },

    /// The single-flight computation this caller waited on failed
    #[error("Cached computation for {fingerprint} failed: {reason}")]
    CacheComputationFailed { fingerprint: String, reason: String },

    /// Overflow queue has no room for another pending job
    #[error("Overflow queue is full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    /// Unknown queue job id
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// Credential store failure
    #[error("Credential store error: {0}")]
    Store(String),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

fn retry_suffix_exact(retry_after: &Duration) -> String {
    retry_suffix(&Some(*retry_after))
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" with status {}", code),
        None => String::new(),
    }
}

impl RelayError {
    /// Retry guidance carried by the error, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RelayError::CircuitOpen { retry_after, .. } => *retry_after,
            RelayError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            RelayError::Upstream { retry_after, .. } => *retry_after,
            RelayError::AllProvidersExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::CircuitOpen { .. }
                | RelayError::RateLimitExceeded { .. }
                | RelayError::Upstream { .. }
                | RelayError::Timeout(_)
                | RelayError::AllProvidersExhausted { .. }
                | RelayError::CacheComputationFailed { .. }
                | RelayError::QueueFull { .. }
        )
    }
}

/// Result type alias for keyrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_retry_hint() {
        let err = RelayError::AllProvidersExhausted {
            attempts: 2,
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(
            err.to_string(),
            "All providers exhausted after 2 attempt(s), retry after 1500ms"
        );
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_empty_pool_is_not_transient() {
        let err = RelayError::EmptyPool {
            reason: "no credential grants write".to_string(),
        };
        assert!(!err.is_transient());
        assert!(RelayError::Timeout("slow".to_string()).is_transient());
    }
}
