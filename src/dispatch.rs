//! Dispatcher
//!
//! One pass per request: cache lookup, overflow check, credential selection,
//! then breaker-guarded upstream attempts in ranked order until one succeeds.

use crate::api::{Completion, DispatchOutcome, InboundRequest, NormalizedRequest, ResponseSource};
use crate::cache::ResponseCache;
use crate::client::UpstreamConnector;
use crate::clock::SharedClock;
use crate::config::DispatchSettings;
use crate::error::{RelayError, Result};
use crate::limits::Admission;
use crate::queue::{JobExecutor, JobId, JobStatus, OverflowQueue};
use crate::router::{Candidate, SelectionCriteria, Selector};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keep the smaller of two optional retry hints
fn soonest(current: Option<Duration>, candidate: Option<Duration>) -> Option<Duration> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Why one attempt did not produce a completion
enum AttemptError {
    /// Never reached the upstream (breaker or quota said no)
    Skipped(Option<Duration>),
    /// Reached the upstream and failed
    Failed(Option<Duration>),
}

/// The synchronous part of dispatch: select, attempt, settle.
///
/// Also the executor of overflow queue jobs, so deferred requests follow the
/// same path (cache included) as synchronous ones.
#[derive(Debug)]
pub struct DispatchCore {
    selector: Arc<Selector>,
    cache: Arc<ResponseCache>,
    connector: Arc<dyn UpstreamConnector>,
    attempt_timeout: Duration,
    clock: SharedClock,
}

impl DispatchCore {
    pub fn new(
        selector: Arc<Selector>,
        cache: Arc<ResponseCache>,
        connector: Arc<dyn UpstreamConnector>,
        attempt_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            selector,
            cache,
            connector,
            attempt_timeout,
            clock,
        }
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Serve a request through the cache when it is cacheable, otherwise go
    /// straight to the upstream
    pub async fn complete(&self, request: &NormalizedRequest) -> Result<(Arc<Completion>, ResponseSource)> {
        if request.cacheable && self.cache.is_enabled() {
            let fingerprint = request.fingerprint();
            let ttl = self.cache.config().default_ttl;
            self.cache
                .get_or_compute(&fingerprint, ttl, || self.forward(request))
                .await
        } else {
            let completion = self.forward(request).await?;
            Ok((Arc::new(completion), ResponseSource::Upstream))
        }
    }

    /// Try ranked candidates until one succeeds.
    ///
    /// Fails with [`RelayError::EmptyPool`] when nothing passes static
    /// filtering, otherwise with [`RelayError::AllProvidersExhausted`]
    /// carrying the soonest retry hint seen across skips and failures.
    pub async fn forward(&self, request: &NormalizedRequest) -> Result<Completion> {
        let criteria = SelectionCriteria::from(request);
        let decision = self.selector.select(&criteria)?;

        let mut retry_after = decision.soonest_retry();
        let mut attempts = 0usize;

        for candidate in &decision.candidates {
            match self.attempt(candidate, request).await {
                Ok(completion) => return Ok(completion),
                Err(AttemptError::Skipped(hint)) => {
                    retry_after = soonest(retry_after, hint);
                }
                Err(AttemptError::Failed(hint)) => {
                    attempts += 1;
                    retry_after = soonest(retry_after, hint);
                }
            }
        }

        warn!(
            model = %request.model,
            attempts,
            skipped = decision.skipped.len(),
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "All providers exhausted"
        );
        Err(RelayError::AllProvidersExhausted {
            attempts,
            retry_after,
        })
    }

    async fn attempt(
        &self,
        candidate: &Candidate,
        request: &NormalizedRequest,
    ) -> std::result::Result<Completion, AttemptError> {
        let provider = candidate.provider_id.as_str();
        let credential = candidate.credential_id.as_str();

        // State may have moved since selection; both checks run again here.
        let breaker = self.selector.breakers().breaker_for(provider, credential);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                debug!(provider, credential, error = %e, "Candidate skipped: circuit open");
                return Err(AttemptError::Skipped(e.retry_after()));
            }
        };

        let reservation = match self
            .selector
            .limiter()
            .admit(&candidate.credential, request.estimated_tokens)
        {
            Admission::Admitted(reservation) => reservation,
            Admission::Denied(denial) => {
                let window = denial.window;
                let err = denial.into_error(credential);
                debug!(provider, window = ?window, error = %err, "Candidate skipped: rate limited");
                return Err(AttemptError::Skipped(err.retry_after()));
            }
        };

        let call = self
            .connector
            .call(&candidate.credential, request, self.attempt_timeout);
        let outcome = match tokio::time::timeout(self.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout(format!(
                "{} did not answer within {}ms",
                provider,
                self.attempt_timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(reply) if reply.success => {
                reservation.commit(reply.tokens_used, reply.latency_ms);
                permit.success();
                self.selector.remember(&request.caller_id, credential);
                debug!(
                    provider,
                    credential,
                    tokens = reply.tokens_used,
                    latency_ms = reply.latency_ms,
                    "Upstream call succeeded"
                );
                Ok(Completion {
                    payload: reply.payload,
                    provider_id: candidate.provider_id.clone(),
                    credential_id: candidate.credential_id.clone(),
                    model: request.model.clone(),
                    tokens_used: reply.tokens_used,
                    latency_ms: reply.latency_ms,
                    status_code: reply.status_code,
                    completed_at: self.clock.now(),
                })
            }
            Ok(reply) => {
                reservation.release();
                permit.failure();
                warn!(
                    provider,
                    credential,
                    status = reply.status_code,
                    "Upstream call failed, trying next candidate"
                );
                Err(AttemptError::Failed(reply.retry_after))
            }
            Err(e) => {
                reservation.release();
                permit.failure();
                warn!(provider, credential, error = %e, "Upstream call failed, trying next candidate");
                Err(AttemptError::Failed(e.retry_after()))
            }
        }
    }
}

#[async_trait]
impl JobExecutor for DispatchCore {
    async fn execute(&self, request: NormalizedRequest) -> Result<Arc<Completion>> {
        self.complete(&request).await.map(|(completion, _)| completion)
    }
}

/// Entry point for inbound requests
#[derive(Debug)]
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    queue: Arc<OverflowQueue>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(core: Arc<DispatchCore>, queue: Arc<OverflowQueue>, settings: DispatchSettings) -> Self {
        Self {
            core,
            queue,
            settings,
        }
    }

    pub fn core(&self) -> &Arc<DispatchCore> {
        &self.core
    }

    pub fn queue(&self) -> &Arc<OverflowQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Normalize and dispatch an inbound request
    pub async fn dispatch(&self, request: InboundRequest) -> Result<DispatchOutcome> {
        let pool = self.core.selector.pool();
        let normalized = request.normalize(|p| pool.is_provider(p));
        self.dispatch_normalized(normalized).await
    }

    /// Dispatch an already-normalized request
    pub async fn dispatch_normalized(&self, request: NormalizedRequest) -> Result<DispatchOutcome> {
        let cache = &self.core.cache;
        if request.cacheable && cache.is_enabled() {
            let fingerprint = request.fingerprint();
            if let Some(completion) = cache.get(&fingerprint) {
                debug!(fingerprint = %fingerprint.short(), "Served from cache");
                return Ok(DispatchOutcome::Completed {
                    completion,
                    source: ResponseSource::Cache,
                });
            }
        }

        if let Some(threshold) = self.settings.overflow_threshold_tokens {
            if request.estimated_tokens > threshold {
                let (estimated_tokens, priority) = (request.estimated_tokens, request.priority);
                let job_id = self.queue.enqueue(request, priority)?;
                info!(job_id = %job_id, estimated_tokens, threshold, "Request deferred to overflow queue");
                return Ok(DispatchOutcome::Queued { job_id });
            }
        }

        let (completion, source) = self.core.complete(&request).await?;
        Ok(DispatchOutcome::Completed { completion, source })
    }

    /// Status of a deferred request
    pub fn poll_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.queue.poll_status(job_id)
    }

    /// Cancel a pending deferred request
    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.queue.cancel(job_id)
    }

    /// Wait for a deferred request to finish and take its result
    pub async fn wait_result(&self, job_id: &JobId) -> Result<Arc<Completion>> {
        let status = self.queue.wait(job_id).await?;
        if status == JobStatus::Cancelled {
            return Err(RelayError::JobNotFound(format!("{} (cancelled)", job_id)));
        }
        self.queue
            .take_result(job_id)
            .unwrap_or_else(|| Err(RelayError::JobNotFound(job_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Message;
    use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitState};
    use crate::cache::CacheConfig;
    use crate::client::UpstreamReply;
    use crate::clock::ManualClock;
    use crate::limits::{Quotas, RateLimiter, UsageLedger};
    use crate::queue::QueueConfig;
    use crate::router::{Credential, CredentialPool, Provider, Strategy};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    /// Replies per provider; records every call
    #[derive(Debug, Default)]
    struct Scripted {
        failing: Mutex<HashMap<String, u16>>,
        stalled: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn fail(&self, provider: &str, status: u16) {
            self.failing.lock().insert(provider.to_string(), status);
        }

        fn stall(&self, provider: &str) {
            self.stalled.lock().insert(provider.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl UpstreamConnector for Scripted {
        async fn call(
            &self,
            credential: &Credential,
            _request: &NormalizedRequest,
            _timeout: Duration,
        ) -> Result<UpstreamReply> {
            self.calls.lock().push(credential.id.clone());
            let stalled = self.stalled.lock().contains(&credential.provider_id);
            if stalled {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            match self.failing.lock().get(&credential.provider_id) {
                Some(status) => Ok(UpstreamReply::failed(*status, 5)
                    .with_retry_after(Duration::from_secs(20))),
                None => Ok(UpstreamReply::ok(
                    serde_json::json!({ "served_by": credential.id }),
                    25,
                    5,
                )),
            }
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        pool: Arc<CredentialPool>,
        ledger: Arc<UsageLedger>,
        breakers: Arc<BreakerRegistry>,
        connector: Arc<Scripted>,
        dispatcher: Dispatcher,
    }

    fn fixture(threshold: Option<u64>) -> Fixture {
        fixture_with_timeout(threshold, Duration::from_secs(5))
    }

    fn fixture_with_timeout(threshold: Option<u64>, attempt_timeout: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let pool = Arc::new(CredentialPool::new());
        pool.upsert_provider(Provider::new("alpha"));
        pool.upsert_provider(Provider::new("beta"));
        pool.add(Credential::new("a1", "alpha", "sk-a1")).unwrap();
        pool.add(Credential::new("b1", "beta", "sk-b1")).unwrap();

        let ledger = Arc::new(UsageLedger::new(clock.clone()));
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            clock.clone(),
        ));
        let selector = Arc::new(Selector::new(
            pool.clone(),
            RateLimiter::new(ledger.clone()),
            breakers.clone(),
            Strategy::LeastUsed,
        ));
        let cache = Arc::new(ResponseCache::new(CacheConfig::default(), clock.clone()));
        let connector = Arc::new(Scripted::default());
        let core = Arc::new(DispatchCore::new(
            selector,
            cache,
            connector.clone(),
            attempt_timeout,
            clock.clone(),
        ));
        let queue = Arc::new(OverflowQueue::new(QueueConfig::default(), clock.clone()));
        let settings = DispatchSettings {
            overflow_threshold_tokens: threshold,
            ..DispatchSettings::default()
        };

        Fixture {
            clock,
            pool,
            ledger,
            breakers,
            connector,
            dispatcher: Dispatcher::new(core, queue, settings),
        }
    }

    fn request(text: &str) -> InboundRequest {
        InboundRequest::new("caller-1", "m-1", vec![Message::user(text)]).with_estimated_tokens(10.0)
    }

    #[tokio::test]
    async fn test_failed_attempt_fails_over_and_counts_nothing() {
        let f = fixture(None);
        f.connector.fail("alpha", 500);

        let outcome = f
            .dispatcher
            .dispatch(request("hi").with_provider_hint("alpha"))
            .await
            .unwrap();

        let completion = outcome.completion().unwrap();
        assert_eq!(completion.credential_id, "b1");
        assert_eq!(f.connector.calls(), vec!["a1", "b1"]);

        let a1 = f.ledger.snapshot("a1");
        assert_eq!(a1.total_tokens, 0);
        assert_eq!(a1.failed_attempts, 1);
        assert_eq!(a1.in_flight, 0);
        assert_eq!(f.ledger.snapshot("b1").total_tokens, 25);
        assert_eq!(f.breakers.provider_state("alpha"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timed_out_attempt_counts_as_failure() {
        let f = fixture_with_timeout(None, Duration::from_millis(50));
        f.connector.stall("alpha");

        let outcome = f
            .dispatcher
            .dispatch(request("hi").with_provider_hint("alpha"))
            .await
            .unwrap();

        assert_eq!(outcome.completion().unwrap().credential_id, "b1");
        assert_eq!(f.connector.calls(), vec!["a1", "b1"]);

        let a1 = f.ledger.snapshot("a1");
        assert_eq!(a1.failed_attempts, 1);
        assert_eq!(a1.total_tokens, 0);
        assert_eq!(a1.in_flight, 0);

        let alpha = f.breakers.breaker_for("alpha", "a1").snapshot();
        assert_eq!(alpha.total_failures, 1);
        assert_eq!(alpha.state, CircuitState::Open);
        assert_eq!(f.breakers.breaker_for("beta", "b1").snapshot().total_successes, 1);
    }

    #[tokio::test]
    async fn test_every_failure_reports_exhausted_with_soonest_hint() {
        let f = fixture(None);
        f.connector.fail("alpha", 503);
        f.connector.fail("beta", 429);

        let err = f.dispatcher.dispatch(request("hi")).await.unwrap_err();
        match err {
            RelayError::AllProvidersExhausted {
                attempts,
                retry_after,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(retry_after, Some(Duration::from_secs(20)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_no_matching_credential_is_empty_pool() {
        let f = fixture(None);
        let request = request("hi").with_permissions([crate::router::Permission::Admin]);

        let err = f.dispatcher.dispatch(request).await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyPool { .. }));
        assert!(f.connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_credential_is_skipped_not_called() {
        let f = fixture(None);
        f.pool
            .update("a1", |c| c.quotas = Quotas::default().per_minute(Some(1), None))
            .unwrap();
        f.pool
            .update("b1", |c| c.quotas = Quotas::default().per_minute(Some(1), None))
            .unwrap();

        f.dispatcher.dispatch(request("one")).await.unwrap();
        f.dispatcher.dispatch(request("two")).await.unwrap();
        let err = f.dispatcher.dispatch(request("three")).await.unwrap_err();

        assert_eq!(f.connector.calls().len(), 2);
        match err {
            RelayError::AllProvidersExhausted {
                attempts,
                retry_after,
            } => {
                assert_eq!(attempts, 0);
                assert!(retry_after.is_some_and(|d| d <= Duration::from_secs(60)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_requests_bypass_cache() {
        let f = fixture(None);
        let streaming = || request("hi").with_stream(true);

        f.dispatcher.dispatch(streaming()).await.unwrap();
        let outcome = f.dispatcher.dispatch(streaming()).await.unwrap();

        assert_eq!(outcome.source(), Some(ResponseSource::Upstream));
        assert_eq!(f.connector.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_expensive_request_is_queued_and_runs_on_workers() {
        let f = fixture(Some(100));
        let queue = f.dispatcher.queue().clone();
        let executor: Arc<dyn JobExecutor> = f.dispatcher.core().clone();
        let workers = queue.start(executor);

        let outcome = f
            .dispatcher
            .dispatch(request("long essay").with_estimated_tokens(5_000.0))
            .await
            .unwrap();
        let job_id = *outcome.job_id().unwrap();

        let completion = f.dispatcher.wait_result(&job_id).await.unwrap();
        assert_eq!(completion.tokens_used, 25);
        assert!(f.dispatcher.poll_status(&job_id).is_none());

        queue.shutdown().await;
        workers.await.unwrap();
    }

    #[tokio::test]
    async fn test_breaker_recovery_after_timeout() {
        let f = fixture(None);
        f.connector.fail("alpha", 500);
        f.dispatcher
            .dispatch(request("first").with_provider_hint("alpha"))
            .await
            .unwrap();
        assert_eq!(f.breakers.provider_state("alpha"), CircuitState::Open);

        f.connector.failing.lock().clear();
        f.clock.advance(Duration::from_secs(30));

        let outcome = f
            .dispatcher
            .dispatch(request("second").with_provider_hint("alpha"))
            .await
            .unwrap();
        assert_eq!(outcome.completion().unwrap().provider_id, "alpha");
        assert_eq!(f.breakers.provider_state("alpha"), CircuitState::Closed);
    }
}
