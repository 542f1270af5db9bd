//! Dispatch Results
//!
//! What the core hands back to the gateway for a request.

use crate::queue::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A successful upstream completion, as stored in the response cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Provider-specific response body, never inspected by the core
    pub payload: serde_json::Value,

    /// Provider that served the request
    pub provider_id: String,

    /// Credential that served the request
    pub credential_id: String,

    /// Normalized model id
    pub model: String,

    /// Tokens reported by the upstream
    pub tokens_used: u64,

    /// Upstream latency
    pub latency_ms: u64,

    /// Upstream status code
    pub status_code: u16,

    /// When the upstream call finished
    pub completed_at: DateTime<Utc>,
}

impl Completion {
    /// Approximate in-memory footprint, used for cache size accounting
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(&self.payload)
            .map(|v| v.len())
            .unwrap_or(0)
            + self.provider_id.len()
            + self.credential_id.len()
            + self.model.len()
    }
}

/// Where a completion came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// This request performed the upstream call
    Upstream,

    /// Served from the response cache
    Cache,

    /// Joined another request's in-flight computation
    Coalesced,
}

/// Result of one dispatch pass
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Synchronous result
    Completed {
        completion: Arc<Completion>,
        source: ResponseSource,
    },

    /// Deferred to the overflow queue
    Queued { job_id: JobId },
}

impl DispatchOutcome {
    /// The completion, if the request was handled synchronously
    pub fn completion(&self) -> Option<&Arc<Completion>> {
        match self {
            DispatchOutcome::Completed { completion, .. } => Some(completion),
            DispatchOutcome::Queued { .. } => None,
        }
    }

    /// Response source, if the request was handled synchronously
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            DispatchOutcome::Completed { source, .. } => Some(*source),
            DispatchOutcome::Queued { .. } => None,
        }
    }

    /// Job handle, if the request was deferred
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            DispatchOutcome::Queued { job_id } => Some(job_id),
            DispatchOutcome::Completed { .. } => None,
        }
    }
}
