//! Rate Limiting
//!
//! Admits or denies an attempt against a credential's minute/hour/day quotas
//! for both requests and tokens. All six checks must pass together.

use crate::clock;
use crate::error::RelayError;
use crate::limits::ledger::{CredentialUsage, Reservation, UsageLedger};
use crate::limits::window::{Quotas, WindowKind};
use crate::router::Credential;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which quota dimension was violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    Requests,
    Tokens,
}

/// Why an admission was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Denial {
    /// The most restrictive violated window
    pub window: WindowKind,

    /// Dimension violated in that window
    pub dimension: QuotaDimension,

    /// Time until every violated window has rolled over
    pub retry_after: Duration,

    /// The estimate alone is larger than the window's token quota
    pub exceeds_capacity: bool,
}

impl Denial {
    /// Error reported for `credential` when this denial ends an attempt
    pub fn into_error(self, credential: impl Into<String>) -> RelayError {
        RelayError::RateLimitExceeded {
            credential: credential.into(),
            retry_after: self.retry_after,
        }
    }
}

/// Result of an admission attempt
#[derive(Debug)]
pub enum Admission {
    /// Quota reserved; settle the reservation after the attempt
    Admitted(Reservation),

    /// Over quota
    Denied(Denial),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Quota enforcement on top of the shared [`UsageLedger`]
#[derive(Debug, Clone)]
pub struct RateLimiter {
    ledger: Arc<UsageLedger>,
}

impl RateLimiter {
    /// Create a rate limiter over a ledger
    pub fn new(ledger: Arc<UsageLedger>) -> Self {
        Self { ledger }
    }

    /// The underlying ledger
    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Check quotas and reserve one request plus `estimated_tokens`.
    ///
    /// The estimate is expected to be rounded up already (see
    /// [`crate::api::InboundRequest::normalize`]).
    pub fn admit(&self, credential: &Credential, estimated_tokens: u64) -> Admission {
        let quotas = credential.quotas;
        match self
            .ledger
            .try_reserve(&credential.id, estimated_tokens, |usage, now| {
                evaluate(usage, &quotas, estimated_tokens, now)
            }) {
            Ok(reservation) => Admission::Admitted(reservation),
            Err(denial) => {
                debug!(
                    credential = %credential.id,
                    window = ?denial.window,
                    dimension = ?denial.dimension,
                    retry_after_ms = denial.retry_after.as_millis() as u64,
                    "Admission denied"
                );
                Admission::Denied(denial)
            }
        }
    }

    /// Same evaluation as [`RateLimiter::admit`] without reserving anything
    pub fn check(&self, credential: &Credential, estimated_tokens: u64) -> Result<(), Denial> {
        self.ledger.inspect(&credential.id, |usage, now| {
            evaluate(usage, &credential.quotas, estimated_tokens, now)
        })
    }
}

fn evaluate(
    usage: &CredentialUsage,
    quotas: &Quotas,
    tokens: u64,
    now: DateTime<Utc>,
) -> Result<(), Denial> {
    let mut worst: Option<Denial> = None;

    for kind in WindowKind::ALL {
        let quota = quotas.get(kind);
        let counter = usage.counter(kind);
        let retry_after = clock::until(now, kind.end_of(counter.window_start));

        let violation = if quota
            .requests
            .is_some_and(|limit| counter.requests.saturating_add(1) > limit)
        {
            Some((QuotaDimension::Requests, false))
        } else if let Some(limit) = quota.tokens.filter(|limit| counter.tokens.saturating_add(tokens) > *limit) {
            Some((QuotaDimension::Tokens, tokens > limit))
        } else {
            None
        };

        if let Some((dimension, exceeds_capacity)) = violation {
            let denial = Denial {
                window: kind,
                dimension,
                retry_after,
                exceeds_capacity,
            };
            worst = match worst {
                Some(prev) if prev.retry_after >= denial.retry_after => Some(Denial {
                    exceeds_capacity: prev.exceeds_capacity || denial.exceeds_capacity,
                    ..prev
                }),
                Some(prev) => Some(Denial {
                    exceeds_capacity: prev.exceeds_capacity || denial.exceeds_capacity,
                    ..denial
                }),
                None => Some(denial),
            };
        }
    }

    match worst {
        Some(denial) => Err(denial),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::router::Credential;
    use chrono::TimeZone;

    fn setup(quotas: Quotas) -> (Arc<ManualClock>, RateLimiter, Credential) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 10).unwrap(),
        ));
        let ledger = Arc::new(UsageLedger::new(clock.clone()));
        let credential = Credential::new("k1", "openai", "sk-test").with_quotas(quotas);
        (clock, RateLimiter::new(ledger), credential)
    }

    fn admit_and_commit(limiter: &RateLimiter, credential: &Credential, tokens: u64) {
        match limiter.admit(credential, tokens) {
            Admission::Admitted(r) => r.commit(tokens, 1),
            Admission::Denied(d) => panic!("unexpected denial: {:?}", d),
        }
    }

    #[test]
    fn test_limit_plus_one_is_denied_until_rollover() {
        let (clock, limiter, credential) = setup(Quotas::unlimited().per_minute(Some(3), None));

        for _ in 0..3 {
            admit_and_commit(&limiter, &credential, 1);
        }

        match limiter.admit(&credential, 1) {
            Admission::Denied(denial) => {
                assert_eq!(denial.window, WindowKind::Minute);
                assert_eq!(denial.dimension, QuotaDimension::Requests);
                assert_eq!(denial.retry_after, Duration::from_secs(50));
            }
            Admission::Admitted(_) => panic!("4th request must be denied"),
        }

        clock.advance(Duration::from_secs(50));
        assert!(limiter.admit(&credential, 1).is_admitted());
    }

    #[test]
    fn test_denial_becomes_transient_rate_limit_error() {
        let (_, limiter, credential) = setup(Quotas::unlimited().per_minute(Some(1), None));
        admit_and_commit(&limiter, &credential, 1);

        let err = limiter.check(&credential, 1).unwrap_err().into_error(&credential.id);
        assert!(matches!(
            &err,
            RelayError::RateLimitExceeded { credential, .. } if credential == "k1"
        ));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(50)));
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for credential 'k1', retry after 50000ms"
        );
    }

    #[test]
    fn test_token_quota_uses_estimate_then_actual() {
        let (_, limiter, credential) = setup(Quotas::unlimited().per_minute(None, Some(100)));

        let Admission::Admitted(first) = limiter.admit(&credential, 60) else {
            panic!("first admission");
        };
        // 60 reserved + 60 requested > 100
        assert!(limiter.check(&credential, 60).is_err());

        first.commit(30, 1);
        // 30 used + 60 requested <= 100
        assert!(limiter.check(&credential, 60).is_ok());
    }

    #[test]
    fn test_most_restrictive_window_wins() {
        let (_, limiter, credential) = setup(
            Quotas::unlimited()
                .per_minute(Some(1), None)
                .per_hour(Some(1), None),
        );
        admit_and_commit(&limiter, &credential, 0);

        let denial = limiter.check(&credential, 0).unwrap_err();
        assert_eq!(denial.window, WindowKind::Hour);
        // 12:30:10 -> 13:00:00
        assert_eq!(denial.retry_after, Duration::from_secs(29 * 60 + 50));
    }

    #[test]
    fn test_estimate_larger_than_quota() {
        let (_, limiter, credential) = setup(Quotas::unlimited().per_day(None, Some(1_000)));

        let denial = limiter.check(&credential, 5_000).unwrap_err();
        assert!(denial.exceeds_capacity);
        assert_eq!(denial.dimension, QuotaDimension::Tokens);
    }

    #[test]
    fn test_check_does_not_reserve() {
        let (_, limiter, credential) = setup(Quotas::unlimited().per_minute(Some(1), None));

        assert!(limiter.check(&credential, 10).is_ok());
        assert!(limiter.check(&credential, 10).is_ok());
        assert!(limiter.admit(&credential, 10).is_admitted());
    }

    #[test]
    fn test_unlimited_credential_always_admitted() {
        let (_, limiter, credential) = setup(Quotas::unlimited());
        for _ in 0..1_000 {
            admit_and_commit(&limiter, &credential, 1_000);
        }
    }
}
