//! Queue Jobs
//!
//! Identifiers, priorities and lifecycle states of deferred requests.

use crate::api::{Completion, NormalizedRequest};
use crate::error::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Handle returned for a deferred request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a new random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| RelayError::JobNotFound(s.to_string()))
    }
}

/// Queue priority; higher runs first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Completed, failed or cancelled
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Public view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub status: JobStatus,
    pub priority: Priority,
    pub model: String,
    pub estimated_tokens: u64,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether a terminal result is still waiting to be taken
    pub result_pending: bool,
}

pub(crate) struct QueueJob {
    pub(crate) id: JobId,
    pub(crate) request: NormalizedRequest,
    pub(crate) priority: Priority,
    pub(crate) status: JobStatus,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) result: Option<Result<Arc<Completion>>>,
    pub(crate) status_tx: watch::Sender<JobStatus>,
}

impl QueueJob {
    pub(crate) fn new(request: NormalizedRequest, priority: Priority, now: DateTime<Utc>) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        Self {
            id: JobId::new(),
            request,
            priority,
            status: JobStatus::Pending,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            status_tx,
        }
    }

    pub(crate) fn transition(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        match status {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status_tx.send_replace(status);
    }

    pub(crate) fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            status: self.status,
            priority: self.priority,
            model: self.request.model.clone(),
            estimated_tokens: self.request.estimated_tokens,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            result_pending: self.result.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_job_id_round_trip_through_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
