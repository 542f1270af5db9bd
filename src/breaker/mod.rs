//! Circuit Breaking
//!
//! Three-state breaker guarding each provider (optionally each credential).
//!
//! States:
//! - Closed: calls pass; failures inside the trailing window are counted
//! - Open: calls fail fast until `next_retry`
//! - HalfOpen: exactly one trial call decides between Closed and Open
//!
//! The Open -> HalfOpen transition is lazy: it happens when a call is
//! attempted at or after `next_retry`, never on a timer.

pub mod registry;

pub use registry::BreakerRegistry;

use crate::clock::{self, SharedClock};
use crate::error::{RelayError, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the recovery deadline
    Open,
    /// One trial call is in progress or allowed
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that open the circuit
    pub failure_threshold: u32,
    /// Trailing window over which failures are counted
    pub failure_window: Duration,
    /// Wait after the first trip before a trial call is allowed
    pub recovery_timeout: Duration,
    /// Growth factor of the wait after each failed trial
    pub backoff_multiplier: f64,
    /// Upper bound on the wait
    pub max_recovery_timeout: Duration,
    /// Keep one breaker per credential instead of per provider
    pub per_credential: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(600),
            per_credential: false,
        }
    }
}

impl BreakerConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.recovery_timeout)
            .with_randomization_factor(0.0)
            .with_multiplier(self.backoff_multiplier)
            .with_max_interval(self.max_recovery_timeout)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Failures inside the trailing window
    pub recent_failures: usize,
    pub last_transition: DateTime<Utc>,
    pub next_retry: Option<DateTime<Utc>>,
    /// Wait that was applied on the most recent trip
    pub current_backoff_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub trips: u64,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: DateTime<Utc>,
    next_retry: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    backoff: ExponentialBackoff,
    current_backoff: Duration,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
    trips: u64,
}

/// Circuit breaker for one provider or credential
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        let backoff = config.backoff();
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition: now,
                next_retry: None,
                trial_in_flight: false,
                backoff,
                current_backoff: Duration::ZERO,
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
                trips: 0,
            }),
        }
    }

    /// Provider or credential this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, without triggering any transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask for permission to make a call.
    ///
    /// An Open breaker whose recovery deadline has passed moves to HalfOpen
    /// and hands out the single trial permit. Rejections carry the remaining
    /// wait when it is known.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(Arc::clone(self), false)),
            CircuitState::Open => {
                let next_retry = inner.next_retry.unwrap_or(now);
                if now >= next_retry {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_transition = now;
                    inner.consecutive_successes = 0;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                    Ok(BreakerPermit::new(Arc::clone(self), true))
                } else {
                    inner.total_rejections += 1;
                    Err(RelayError::CircuitOpen {
                        target: self.name.clone(),
                        retry_after: Some(clock::until(now, next_retry)),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    Err(RelayError::CircuitOpen {
                        target: self.name.clone(),
                        retry_after: None,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(Arc::clone(self), true))
                }
            }
        }
    }

    /// Whether a call would currently be let through, without changing state.
    ///
    /// `Err` carries the remaining wait, or `None` when a half-open trial is
    /// already running.
    pub fn availability(&self) -> std::result::Result<(), Option<Duration>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let next_retry = inner.next_retry.unwrap_or(now);
                if now >= next_retry {
                    Ok(())
                } else {
                    Err(Some(clock::until(now, next_retry)))
                }
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(None),
            CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Record a successful call made outside of a permit
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Record a failed call made outside of a permit
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// Snapshot of counters and timestamps
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.prune(&mut inner, now);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            recent_failures: inner.failures.len(),
            last_transition: inner.last_transition,
            next_retry: inner.next_retry,
            current_backoff_ms: inner.current_backoff.as_millis() as u64,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            trips: inner.trips,
        }
    }

    /// Force the breaker back to Closed
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.close(&mut inner, now);
        info!(breaker = %self.name, "Circuit manually reset");
    }

    fn on_success(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.failures.clear();
                inner.consecutive_failures = 0;
                inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
            }
            CircuitState::HalfOpen if trial => {
                self.close(&mut inner, now);
                info!(breaker = %self.name, "Circuit closed after successful trial");
            }
            // Stale outcome of a call admitted before the breaker opened
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.failures.push_back(now);
                self.prune(&mut inner, now);

                if inner.failures.len() >= self.config.failure_threshold as usize {
                    inner.backoff.reset();
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.trial_in_flight = false;
                self.open(&mut inner, now);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn open(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        let wait = inner
            .backoff
            .next_backoff()
            .unwrap_or(self.config.max_recovery_timeout);
        // Backoff adds up to a nanosecond of jitter even with randomization off
        let wait = Duration::from_millis(wait.as_millis() as u64).min(self.config.max_recovery_timeout);
        let next_retry = now + clock::to_chrono(wait);

        inner.state = CircuitState::Open;
        inner.last_transition = now;
        inner.next_retry = Some(next_retry);
        inner.current_backoff = wait;
        inner.trips += 1;

        warn!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            retry_after_ms = wait.as_millis() as u64,
            "Circuit opened"
        );
    }

    fn close(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        inner.state = CircuitState::Closed;
        inner.last_transition = now;
        inner.next_retry = None;
        inner.trial_in_flight = false;
        inner.failures.clear();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.current_backoff = Duration::ZERO;
        inner.backoff.reset();
    }

    fn prune(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        let horizon = now - clock::to_chrono(self.config.failure_window);
        while inner.failures.front().is_some_and(|t| *t <= horizon) {
            inner.failures.pop_front();
        }
    }
}

/// Permission to make one guarded call.
///
/// Report the outcome with [`BreakerPermit::success`] or
/// [`BreakerPermit::failure`]. Dropping an unreported trial permit frees the
/// half-open slot without deciding the breaker's state.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this is the half-open trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The breaker that issued the permit
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Report a successful call
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Report a failed call
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
