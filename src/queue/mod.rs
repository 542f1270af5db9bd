//! Overflow Queue
//!
//! Deferred execution for requests whose estimated cost is above the
//! synchronous threshold. Jobs run on a bounded worker pool in priority
//! order, FIFO within a priority. Results are delivered once.

pub mod job;

pub use job::{JobId, JobInfo, JobStatus, Priority};

use crate::api::{Completion, NormalizedRequest};
use crate::clock::{self, SharedClock};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use job::QueueJob;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runs a deferred request
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, request: NormalizedRequest) -> Result<Arc<Completion>>;
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Jobs running at the same time
    pub max_workers: usize,
    /// Pending jobs accepted before `QueueFull`
    pub max_pending: usize,
    /// How long an undelivered terminal job is kept
    pub result_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_pending: 1_000,
            result_ttl: Duration::from_secs(900),
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_enqueued: u64,
    pub total_expired: u64,
    pub max_workers: usize,
}

#[derive(Default)]
struct QueueState {
    /// (priority, Reverse(sequence)) so the max-heap pops the highest
    /// priority first and the oldest job within a priority
    heap: BinaryHeap<(Priority, Reverse<u64>, JobId)>,
    jobs: HashMap<JobId, QueueJob>,
    next_seq: u64,
}

/// Priority queue with a bounded worker pool
pub struct OverflowQueue {
    config: QueueConfig,
    clock: SharedClock,
    state: Mutex<QueueState>,
    job_ready: Notify,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    total_enqueued: AtomicU64,
    total_expired: AtomicU64,
}

impl std::fmt::Debug for OverflowQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverflowQueue")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl OverflowQueue {
    /// Create a stopped queue; call [`OverflowQueue::start`] to run jobs
    pub fn new(config: QueueConfig, clock: SharedClock) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            clock,
            state: Mutex::new(QueueState::default()),
            job_ready: Notify::new(),
            shutdown,
            total_enqueued: AtomicU64::new(0),
            total_expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Defer a request
    pub fn enqueue(&self, request: NormalizedRequest, priority: Priority) -> Result<JobId> {
        self.sweep_finished();

        let now = self.clock.now();
        let job = QueueJob::new(request, priority, now);
        let id = job.id;

        {
            let mut state = self.state.lock();
            let pending = state
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Pending)
                .count();
            if pending >= self.config.max_pending {
                return Err(RelayError::QueueFull {
                    capacity: self.config.max_pending,
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push((priority, Reverse(seq), id));
            state.jobs.insert(id, job);
        }

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.job_ready.notify_one();
        debug!(job_id = %id, ?priority, "Job enqueued");
        Ok(id)
    }

    /// Current status of a job
    pub fn poll_status(&self, id: &JobId) -> Option<JobStatus> {
        self.state.lock().jobs.get(id).map(|j| j.status)
    }

    /// Details of a job
    pub fn job_info(&self, id: &JobId) -> Option<JobInfo> {
        self.state.lock().jobs.get(id).map(|j| j.info())
    }

    /// Cancel a pending job. Running and finished jobs are left alone.
    pub fn cancel(&self, id: &JobId) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.transition(JobStatus::Cancelled, now);
                debug!(job_id = %id, "Job cancelled");
                true
            }
            _ => false,
        }
    }

    /// Take a finished job's result. Each result is handed out once; the
    /// job is forgotten afterwards.
    pub fn take_result(&self, id: &JobId) -> Option<Result<Arc<Completion>>> {
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(id)?;
        if !matches!(job.status, JobStatus::Completed | JobStatus::Failed) {
            return None;
        }
        let result = job.result.take();
        if result.is_some() {
            state.jobs.remove(id);
        }
        result
    }

    /// Wait until a job reaches a terminal status
    pub async fn wait(&self, id: &JobId) -> Result<JobStatus> {
        let mut rx = {
            let state = self.state.lock();
            state
                .jobs
                .get(id)
                .map(|j| j.status_tx.subscribe())
                .ok_or_else(|| RelayError::JobNotFound(id.to_string()))?
        };

        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| RelayError::JobNotFound(id.to_string()))?;
        Ok(status)
    }

    /// Forget terminal jobs older than the result TTL. Returns how many were
    /// dropped.
    pub fn sweep_finished(&self) -> usize {
        let now = self.clock.now();
        let ttl = clock::to_chrono(self.config.result_ttl);
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| match job.finished_at {
            Some(finished) if job.status.is_terminal() => finished + ttl > now,
            _ => true,
        });
        let removed = before - state.jobs.len();
        drop(state);

        if removed > 0 {
            self.total_expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Expired undelivered job results");
        }
        removed
    }

    /// Start the worker loop
    pub fn start(self: &Arc<Self>, executor: Arc<dyn JobExecutor>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        info!(max_workers = self.config.max_workers, "Overflow queue started");

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    permit = Arc::clone(&queue.workers).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                };

                let next = loop {
                    if *shutdown.borrow() {
                        break None;
                    }
                    if let Some(job) = queue.pop_next() {
                        break Some(job);
                    }
                    tokio::select! {
                        _ = queue.job_ready.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                };
                let Some((id, request)) = next else {
                    break;
                };

                let worker_queue = Arc::clone(&queue);
                let executor = Arc::clone(&executor);
                tokio::spawn(async move {
                    let result = executor.execute(request).await;
                    worker_queue.finish(&id, result);
                    drop(permit);
                });
            }
            info!("Overflow queue stopped");
        })
    }

    /// Stop taking new jobs and wait for running ones to finish
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let workers = self.config.max_workers.max(1) as u32;
        if let Ok(permits) = self.workers.acquire_many(workers).await {
            drop(permits);
        }
    }

    /// Current statistics
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let count = |status: JobStatus| state.jobs.values().filter(|j| j.status == status).count();
        QueueStats {
            pending: count(JobStatus::Pending),
            running: count(JobStatus::Running),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
            max_workers: self.config.max_workers,
        }
    }

    fn pop_next(&self) -> Option<(JobId, NormalizedRequest)> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        while let Some((_, _, id)) = state.heap.pop() {
            // Cancelled jobs stay in the heap until they surface here
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.status == JobStatus::Pending {
                    job.transition(JobStatus::Running, now);
                    debug!(job_id = %id, priority = ?job.priority, "Job started");
                    return Some((id, job.request.clone()));
                }
            }
        }
        None
    }

    fn finish(&self, id: &JobId, result: Result<Arc<Completion>>) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return;
        };
        let status = match &result {
            Ok(_) => JobStatus::Completed,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job failed");
                JobStatus::Failed
            }
        };
        job.result = Some(result);
        job.transition(status, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InboundRequest, Message};
    use crate::clock::ManualClock;
    use chrono::Utc;
    use tokio::sync::Notify;

    fn request(tag: &str) -> NormalizedRequest {
        InboundRequest::new(tag, "gpt-4o", vec![Message::user(tag)]).normalize(|_| false)
    }

    fn completion(tag: &str) -> Completion {
        Completion {
            payload: serde_json::json!({ "tag": tag }),
            provider_id: "openai".to_string(),
            credential_id: "k1".to_string(),
            model: "gpt-4o".to_string(),
            tokens_used: 1,
            latency_ms: 1,
            status_code: 200,
            completed_at: Utc::now(),
        }
    }

    /// Records execution order; fails requests from caller "bad"
    #[derive(Default)]
    struct Recorder {
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobExecutor for Recorder {
        async fn execute(&self, request: NormalizedRequest) -> Result<Arc<Completion>> {
            self.order.lock().push(request.caller_id.clone());
            tokio::time::sleep(Duration::from_millis(5)).await;
            if request.caller_id == "bad" {
                return Err(RelayError::Internal("boom".to_string()));
            }
            Ok(Arc::new(completion(&request.caller_id)))
        }
    }

    /// Blocks until released
    struct Gate {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl JobExecutor for Gate {
        async fn execute(&self, request: NormalizedRequest) -> Result<Arc<Completion>> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Arc::new(completion(&request.caller_id)))
        }
    }

    fn queue(config: QueueConfig) -> Arc<OverflowQueue> {
        Arc::new(OverflowQueue::new(config, Arc::new(ManualClock::starting_now())))
    }

    fn single_worker() -> QueueConfig {
        QueueConfig {
            max_workers: 1,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let queue = queue(single_worker());
        let jobs = [
            ("low", Priority::Low),
            ("high-1", Priority::High),
            ("normal", Priority::Normal),
            ("high-2", Priority::High),
            ("critical", Priority::Critical),
        ];
        let mut ids = Vec::new();
        for (tag, priority) in jobs {
            ids.push(queue.enqueue(request(tag), priority).unwrap());
        }

        let recorder = Arc::new(Recorder::default());
        queue.start(recorder.clone());
        for id in &ids {
            assert_eq!(queue.wait(id).await.unwrap(), JobStatus::Completed);
        }

        assert_eq!(
            *recorder.order.lock(),
            vec!["critical", "high-1", "high-2", "normal", "low"]
        );
    }

    #[tokio::test]
    async fn test_result_delivered_once() {
        let queue = queue(single_worker());
        let ok = queue.enqueue(request("good"), Priority::Normal).unwrap();
        let bad = queue.enqueue(request("bad"), Priority::Normal).unwrap();
        queue.start(Arc::new(Recorder::default()));

        assert_eq!(queue.wait(&ok).await.unwrap(), JobStatus::Completed);
        assert_eq!(queue.wait(&bad).await.unwrap(), JobStatus::Failed);

        let completion = queue.take_result(&ok).unwrap().unwrap();
        assert_eq!(completion.payload["tag"], "good");
        assert!(queue.take_result(&ok).is_none());
        assert!(queue.poll_status(&ok).is_none());

        assert!(matches!(queue.take_result(&bad), Some(Err(RelayError::Internal(_)))));
    }

    #[tokio::test]
    async fn test_running_job_cannot_be_cancelled() {
        let queue = queue(single_worker());
        let gate = Arc::new(Gate {
            started: Notify::new(),
            release: Notify::new(),
        });
        let running = queue.enqueue(request("running"), Priority::Normal).unwrap();
        let waiting = queue.enqueue(request("waiting"), Priority::Normal).unwrap();
        queue.start(gate.clone());

        gate.started.notified().await;
        assert_eq!(queue.poll_status(&running), Some(JobStatus::Running));
        assert!(!queue.cancel(&running));
        assert_eq!(queue.poll_status(&running), Some(JobStatus::Running));

        assert!(queue.cancel(&waiting));
        assert_eq!(queue.poll_status(&waiting), Some(JobStatus::Cancelled));

        gate.release.notify_one();
        assert_eq!(queue.wait(&running).await.unwrap(), JobStatus::Completed);
        assert_eq!(queue.wait(&waiting).await.unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = queue(QueueConfig {
            max_pending: 2,
            ..QueueConfig::default()
        });
        queue.enqueue(request("a"), Priority::Normal).unwrap();
        queue.enqueue(request("b"), Priority::Normal).unwrap();
        let err = queue.enqueue(request("c"), Priority::Normal).unwrap_err();
        assert!(matches!(err, RelayError::QueueFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_undelivered_results_expire() {
        let clock = Arc::new(ManualClock::starting_now());
        let queue = Arc::new(OverflowQueue::new(
            QueueConfig {
                result_ttl: Duration::from_secs(60),
                ..single_worker()
            },
            clock.clone(),
        ));
        let id = queue.enqueue(request("a"), Priority::Normal).unwrap();
        queue.start(Arc::new(Recorder::default()));
        queue.wait(&id).await.unwrap();

        assert_eq!(queue.sweep_finished(), 0);
        clock.advance(Duration::from_secs(60));
        assert_eq!(queue.sweep_finished(), 1);
        assert!(queue.poll_status(&id).is_none());
        assert_eq!(queue.stats().total_expired, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_new_work() {
        let queue = queue(single_worker());
        queue.start(Arc::new(Recorder::default()));
        queue.shutdown().await;

        let id = queue.enqueue(request("late"), Priority::Normal).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.poll_status(&id), Some(JobStatus::Pending));
    }
}
