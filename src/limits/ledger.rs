//! Usage Ledger
//!
//! Per-credential request/token counters over minute, hour and day windows,
//! plus lifetime totals. Every mutation happens under the credential's map
//! entry lock, so window rollover and increments are atomic with respect to
//! each other.

use crate::clock::SharedClock;
use crate::limits::window::{UsageCounter, WindowKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

/// Weight of the newest sample in the latency moving average
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Usage state of one credential
#[derive(Debug, Clone, Serialize)]
pub struct CredentialUsage {
    counters: [UsageCounter; 3],

    /// Reservations taken but not yet committed or released
    pub in_flight: u64,

    /// Successful requests over the credential's lifetime
    pub total_requests: u64,

    /// Tokens reported by successful upstream calls
    pub total_tokens: u64,

    /// Attempts released after an upstream failure or timeout
    pub failed_attempts: u64,

    /// Moving average of successful upstream latency
    pub avg_latency_ms: f64,

    /// Last successful use
    pub last_used: Option<DateTime<Utc>>,
}

impl CredentialUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            counters: WindowKind::ALL.map(|kind| UsageCounter::new(kind, now)),
            in_flight: 0,
            total_requests: 0,
            total_tokens: 0,
            failed_attempts: 0,
            avg_latency_ms: 0.0,
            last_used: None,
        }
    }

    /// Counter for one window kind
    pub fn counter(&self, kind: WindowKind) -> &UsageCounter {
        &self.counters[kind.index()]
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        for kind in WindowKind::ALL {
            self.counters[kind.index()].roll(kind, now);
        }
    }
}

/// An admitted attempt's claim on a credential's quota.
///
/// Settle it with [`Reservation::commit`] or [`Reservation::release`]; dropping
/// it unsettled releases the claim without counting a failure.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<UsageLedger>,
    credential_id: String,
    tokens: u64,
    window_starts: [DateTime<Utc>; 3],
    settled: bool,
}

impl Reservation {
    /// Credential the reservation belongs to
    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    /// Token estimate that was reserved
    pub fn reserved_tokens(&self) -> u64 {
        self.tokens
    }

    /// Record a successful attempt, replacing the estimate with actual usage
    pub fn commit(mut self, tokens_used: u64, latency_ms: u64) {
        self.settled = true;
        self.ledger.settle_commit(&self, tokens_used, latency_ms);
    }

    /// Roll back a failed attempt; it contributes no usage
    pub fn release(mut self) {
        self.settled = true;
        self.ledger.settle_release(&self, true);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.settle_release(self, false);
        }
    }
}

/// Shared usage ledger for all credentials
#[derive(Debug)]
pub struct UsageLedger {
    clock: SharedClock,
    entries: DashMap<String, CredentialUsage>,
}

impl UsageLedger {
    /// Create an empty ledger
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
        }
    }

    /// The ledger's time source
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Atomically roll windows, run `check`, and reserve one request plus
    /// `tokens` if the check passes.
    pub fn try_reserve<E>(
        self: &Arc<Self>,
        credential_id: &str,
        tokens: u64,
        check: impl FnOnce(&CredentialUsage, DateTime<Utc>) -> Result<(), E>,
    ) -> Result<Reservation, E> {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(credential_id.to_string())
            .or_insert_with(|| CredentialUsage::new(now));
        let usage = entry.value_mut();
        usage.roll(now);

        check(usage, now)?;

        for counter in usage.counters.iter_mut() {
            counter.requests = counter.requests.saturating_add(1);
            counter.tokens = counter.tokens.saturating_add(tokens);
        }
        usage.in_flight += 1;
        let window_starts = usage.counters.map(|c| c.window_start);
        drop(entry);

        trace!(credential = %credential_id, tokens, "Reserved quota");

        Ok(Reservation {
            ledger: Arc::clone(self),
            credential_id: credential_id.to_string(),
            tokens,
            window_starts,
            settled: false,
        })
    }

    /// Run `f` against a rolled, read-only view of the credential's usage
    pub fn inspect<R>(&self, credential_id: &str, f: impl FnOnce(&CredentialUsage, DateTime<Utc>) -> R) -> R {
        let now = self.clock.now();
        let mut usage = self
            .entries
            .get(credential_id)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| CredentialUsage::new(now));
        usage.roll(now);
        f(&usage, now)
    }

    /// Snapshot of a credential's usage, with windows rolled to `now`
    pub fn snapshot(&self, credential_id: &str) -> CredentialUsage {
        self.inspect(credential_id, |usage, _| usage.clone())
    }

    /// Requests recorded in the current window
    pub fn window_requests(&self, credential_id: &str, kind: WindowKind) -> u64 {
        self.inspect(credential_id, |usage, _| usage.counter(kind).requests)
    }

    /// Outstanding reservations for a credential
    pub fn in_flight(&self, credential_id: &str) -> u64 {
        self.entries
            .get(credential_id)
            .map(|e| e.in_flight)
            .unwrap_or(0)
    }

    /// Forget a credential entirely (after it has been purged)
    pub fn remove(&self, credential_id: &str) {
        self.entries.remove(credential_id);
    }

    fn settle_commit(&self, reservation: &Reservation, tokens_used: u64, latency_ms: u64) {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(reservation.credential_id.clone())
            .or_insert_with(|| CredentialUsage::new(now));
        let usage = entry.value_mut();
        usage.roll(now);

        for (i, counter) in usage.counters.iter_mut().enumerate() {
            if counter.window_start == reservation.window_starts[i] {
                counter.tokens = counter
                    .tokens
                    .saturating_sub(reservation.tokens)
                    .saturating_add(tokens_used);
            } else {
                // The reservation's window already rolled over; the usage
                // belongs to the window it completed in.
                counter.requests = counter.requests.saturating_add(1);
                counter.tokens = counter.tokens.saturating_add(tokens_used);
            }
        }

        usage.in_flight = usage.in_flight.saturating_sub(1);
        usage.total_requests += 1;
        usage.total_tokens = usage.total_tokens.saturating_add(tokens_used);
        usage.last_used = Some(now);
        usage.avg_latency_ms = if usage.total_requests == 1 {
            latency_ms as f64
        } else {
            LATENCY_EMA_ALPHA * latency_ms as f64 + (1.0 - LATENCY_EMA_ALPHA) * usage.avg_latency_ms
        };
    }

    fn settle_release(&self, reservation: &Reservation, failed: bool) {
        let now = self.clock.now();
        let Some(mut entry) = self.entries.get_mut(&reservation.credential_id) else {
            return;
        };
        let usage = entry.value_mut();
        usage.roll(now);

        for (i, counter) in usage.counters.iter_mut().enumerate() {
            if counter.window_start == reservation.window_starts[i] {
                counter.requests = counter.requests.saturating_sub(1);
                counter.tokens = counter.tokens.saturating_sub(reservation.tokens);
            }
        }

        usage.in_flight = usage.in_flight.saturating_sub(1);
        if failed {
            usage.failed_attempts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::convert::Infallible;
    use std::time::Duration;

    fn ledger() -> (Arc<ManualClock>, Arc<UsageLedger>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 10).unwrap(),
        ));
        let ledger = Arc::new(UsageLedger::new(clock.clone()));
        (clock, ledger)
    }

    fn reserve(ledger: &Arc<UsageLedger>, id: &str, tokens: u64) -> Reservation {
        ledger
            .try_reserve::<Infallible>(id, tokens, |_, _| Ok(()))
            .unwrap()
    }

    #[test]
    fn test_commit_replaces_estimate_with_actual() {
        let (_, ledger) = ledger();

        reserve(&ledger, "k1", 100).commit(42, 250);

        let usage = ledger.snapshot("k1");
        assert_eq!(usage.counter(WindowKind::Minute).requests, 1);
        assert_eq!(usage.counter(WindowKind::Minute).tokens, 42);
        assert_eq!(usage.counter(WindowKind::Day).tokens, 42);
        assert_eq!(usage.total_tokens, 42);
        assert_eq!(usage.in_flight, 0);
        assert_eq!(usage.avg_latency_ms, 250.0);
    }

    #[test]
    fn test_release_contributes_nothing() {
        let (_, ledger) = ledger();

        reserve(&ledger, "k1", 100).commit(10, 5);
        reserve(&ledger, "k1", 100).release();

        let usage = ledger.snapshot("k1");
        assert_eq!(usage.counter(WindowKind::Minute).requests, 1);
        assert_eq!(usage.counter(WindowKind::Minute).tokens, 10);
        assert_eq!(usage.total_tokens, 10);
        assert_eq!(usage.failed_attempts, 1);
    }

    #[test]
    fn test_dropped_reservation_is_released() {
        let (_, ledger) = ledger();
        {
            let _r = reserve(&ledger, "k1", 30);
            assert_eq!(ledger.in_flight("k1"), 1);
        }
        let usage = ledger.snapshot("k1");
        assert_eq!(usage.in_flight, 0);
        assert_eq!(usage.counter(WindowKind::Minute).tokens, 0);
        assert_eq!(usage.failed_attempts, 0);
    }

    #[test]
    fn test_release_after_rollover_never_underflows() {
        let (clock, ledger) = ledger();

        let pending = reserve(&ledger, "k1", 500);
        clock.advance(Duration::from_secs(60));
        reserve(&ledger, "k1", 5).commit(5, 1);
        pending.release();

        let usage = ledger.snapshot("k1");
        // The new minute only carries the committed request
        assert_eq!(usage.counter(WindowKind::Minute).requests, 1);
        assert_eq!(usage.counter(WindowKind::Minute).tokens, 5);
        // The hour window is shared, so the release is rolled back there
        assert_eq!(usage.counter(WindowKind::Hour).requests, 1);
        assert_eq!(usage.counter(WindowKind::Hour).tokens, 5);
    }

    #[test]
    fn test_token_totals_match_successful_usage() {
        let (_, ledger) = ledger();
        let reported = [17u64, 0, 250, 3];

        for (i, tokens) in reported.iter().enumerate() {
            let r = reserve(&ledger, "k1", 100);
            if i % 2 == 0 {
                r.commit(*tokens, 1);
            } else {
                r.release();
            }
        }

        assert_eq!(ledger.snapshot("k1").total_tokens, 17 + 250);
    }

    #[test]
    fn test_concurrent_reservations_are_counted_once_each() {
        let (_, ledger) = ledger();

        std::thread::scope(|s| {
            for _ in 0..8 {
                let ledger = ledger.clone();
                s.spawn(move || {
                    for _ in 0..50 {
                        reserve(&ledger, "shared", 2).commit(2, 1);
                    }
                });
            }
        });

        let usage = ledger.snapshot("shared");
        assert_eq!(usage.counter(WindowKind::Minute).requests, 400);
        assert_eq!(usage.total_tokens, 800);
    }
}
