//! Credential Selection
//!
//! Filters the pool down to credentials that can serve a request and ranks
//! the survivors. Selection itself never records usage.

use crate::api::NormalizedRequest;
use crate::breaker::BreakerRegistry;
use crate::error::{RelayError, Result};
use crate::limits::{QuotaDimension, RateLimiter, WindowKind};
use crate::router::credential::{Credential, Permission};
use crate::router::pool::CredentialPool;
use crate::router::strategy::Strategy;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the caller needs from a credential
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Caller identity, used by the sticky strategy
    pub caller_id: Option<String>,

    /// Provider ranked first when it has eligible credentials
    pub provider_hint: Option<String>,

    /// Permissions the credential must grant
    pub permissions: BTreeSet<Permission>,

    /// Model the provider must support
    pub model: Option<String>,

    /// Ranking strategy; the selector default when unset
    pub strategy: Option<Strategy>,

    /// Rounded-up token estimate
    pub estimated_tokens: u64,
}

impl SelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }
}

impl From<&NormalizedRequest> for SelectionCriteria {
    fn from(request: &NormalizedRequest) -> Self {
        Self {
            caller_id: Some(request.caller_id.clone()),
            provider_hint: request.provider_hint.clone(),
            permissions: request.permissions.clone(),
            model: Some(request.model.clone()),
            strategy: request.strategy,
            estimated_tokens: request.estimated_tokens,
        }
    }
}

/// A ranked (provider, credential) pair
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub provider_id: String,
    pub credential_id: String,

    /// Requests in the current minute window at selection time
    pub window_requests: u64,

    /// Provider cost per token times the estimate
    pub expected_cost: f64,

    #[serde(skip)]
    pub credential: Credential,
}

/// Why an otherwise eligible credential was passed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Its breaker is rejecting calls
    CircuitOpen,

    /// Its quota is used up
    RateLimited {
        window: WindowKind,
        dimension: QuotaDimension,
    },
}

/// A credential excluded by breaker or rate limiter state
#[derive(Debug, Clone, Serialize)]
pub struct SkippedCandidate {
    pub provider_id: String,
    pub credential_id: String,
    pub reason: SkipReason,

    /// When the credential may become usable again, if known
    pub retry_after: Option<Duration>,
}

/// Output of one selection
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// Eligible credentials, best first
    pub candidates: Vec<Candidate>,

    /// Credentials excluded by transient state
    pub skipped: Vec<SkippedCandidate>,

    pub strategy: Strategy,

    /// Human readable summary
    pub reason: String,

    /// 0.0 - 1.0
    pub confidence: f64,
}

impl RoutingDecision {
    /// No candidate to try
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Best candidate
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Soonest known time until a skipped credential frees up
    pub fn soonest_retry(&self) -> Option<Duration> {
        self.skipped.iter().filter_map(|s| s.retry_after).min()
    }
}

/// Ranks credentials for a request
#[derive(Debug)]
pub struct Selector {
    pool: Arc<CredentialPool>,
    limiter: RateLimiter,
    breakers: Arc<BreakerRegistry>,
    default_strategy: Strategy,

    /// caller id -> credential id last used successfully
    sticky: DashMap<String, String>,

    /// Round-robin cursor
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(
        pool: Arc<CredentialPool>,
        limiter: RateLimiter,
        breakers: Arc<BreakerRegistry>,
        default_strategy: Strategy,
    ) -> Self {
        Self {
            pool,
            limiter,
            breakers,
            default_strategy,
            sticky: DashMap::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    /// Produce a ranked candidate list.
    ///
    /// Returns [`RelayError::EmptyPool`] when no credential passes the static
    /// filter (status, provider, model, permissions). Credentials excluded by
    /// breaker or quota state are reported in [`RoutingDecision::skipped`]
    /// instead, so an empty candidate list with skips is still `Ok`.
    pub fn select(&self, criteria: &SelectionCriteria) -> Result<RoutingDecision> {
        let strategy = criteria.strategy.unwrap_or(self.default_strategy);
        let eligible = self.filter_static(criteria)?;

        let mut candidates = Vec::with_capacity(eligible.len());
        let mut skipped = Vec::new();

        for (credential, cost_per_token) in eligible {
            let breaker = self
                .breakers
                .breaker_for(&credential.provider_id, &credential.id);
            if let Err(retry_after) = breaker.availability() {
                skipped.push(SkippedCandidate {
                    provider_id: credential.provider_id.clone(),
                    credential_id: credential.id.clone(),
                    reason: SkipReason::CircuitOpen,
                    retry_after,
                });
                continue;
            }

            if let Err(denial) = self.limiter.check(&credential, criteria.estimated_tokens) {
                skipped.push(SkippedCandidate {
                    provider_id: credential.provider_id.clone(),
                    credential_id: credential.id.clone(),
                    reason: SkipReason::RateLimited {
                        window: denial.window,
                        dimension: denial.dimension,
                    },
                    retry_after: Some(denial.retry_after),
                });
                continue;
            }

            candidates.push(Candidate {
                provider_id: credential.provider_id.clone(),
                credential_id: credential.id.clone(),
                window_requests: self
                    .limiter
                    .ledger()
                    .window_requests(&credential.id, WindowKind::Minute),
                expected_cost: cost_per_token * criteria.estimated_tokens as f64,
                credential,
            });
        }

        let sticky_hit = self.rank(&mut candidates, strategy, criteria);

        let mut notes = Vec::new();
        if let Some(hint) = &criteria.provider_hint {
            if candidates.iter().any(|c| &c.provider_id == hint) {
                candidates.sort_by_key(|c| &c.provider_id != hint);
                notes.push(format!("hinted provider '{}' first", hint));
            } else {
                notes.push(format!("hinted provider '{}' has no eligible credential", hint));
            }
        }
        if sticky_hit {
            notes.push("reusing caller's credential".to_string());
        }

        let considered = candidates.len() + skipped.len();
        let base = if sticky_hit { 0.95 } else { strategy.base_confidence() };
        let confidence = if considered == 0 {
            0.0
        } else {
            base * candidates.len() as f64 / considered as f64
        };

        let mut reason = format!(
            "{}: {} candidate(s), {} skipped",
            strategy,
            candidates.len(),
            skipped.len()
        );
        for note in notes {
            reason.push_str("; ");
            reason.push_str(&note);
        }

        debug!(
            strategy = %strategy,
            candidates = candidates.len(),
            skipped = skipped.len(),
            best = candidates.first().map(|c| c.credential_id.as_str()).unwrap_or("-"),
            "Selected credentials"
        );

        Ok(RoutingDecision {
            candidates,
            skipped,
            strategy,
            reason,
            confidence,
        })
    }

    /// Remember the credential that served a caller (sticky strategy)
    pub fn remember(&self, caller_id: &str, credential_id: &str) {
        self.sticky
            .insert(caller_id.to_string(), credential_id.to_string());
    }

    /// Forget sticky assignments to a credential
    pub fn forget_credential(&self, credential_id: &str) {
        self.sticky.retain(|_, v| v != credential_id);
    }

    /// Credentials that pass status/provider/model/permission checks, with
    /// their provider's cost per token
    fn filter_static(&self, criteria: &SelectionCriteria) -> Result<Vec<(Credential, f64)>> {
        let credentials = self.pool.credentials();
        if credentials.is_empty() {
            return Err(RelayError::EmptyPool {
                reason: "no credentials configured".to_string(),
            });
        }

        let mut inactive = 0usize;
        let mut provider_disabled = 0usize;
        let mut unsupported_model = 0usize;
        let mut missing_permissions = 0usize;
        let mut eligible = Vec::new();

        for credential in credentials {
            if !credential.is_active() {
                inactive += 1;
                continue;
            }
            let Some(provider) = self.pool.provider(&credential.provider_id) else {
                provider_disabled += 1;
                continue;
            };
            if !provider.enabled {
                provider_disabled += 1;
                continue;
            }
            if let Some(model) = &criteria.model {
                if !provider.supports(model) {
                    unsupported_model += 1;
                    continue;
                }
            }
            if !credential.grants(&criteria.permissions) {
                missing_permissions += 1;
                continue;
            }
            eligible.push((credential, provider.cost_per_token));
        }

        if eligible.is_empty() {
            let permissions: Vec<String> =
                criteria.permissions.iter().map(|p| p.to_string()).collect();
            return Err(RelayError::EmptyPool {
                reason: format!(
                    "no credential for model '{}' with permissions [{}] ({} inactive, {} provider disabled, {} unsupported model, {} missing permissions)",
                    criteria.model.as_deref().unwrap_or("*"),
                    permissions.join(", "),
                    inactive,
                    provider_disabled,
                    unsupported_model,
                    missing_permissions
                ),
            });
        }

        Ok(eligible)
    }

    /// Order candidates by strategy. Returns true if a sticky credential was
    /// moved to the front.
    fn rank(&self, candidates: &mut [Candidate], strategy: Strategy, criteria: &SelectionCriteria) -> bool {
        let ledger = self.limiter.ledger();
        let least_used = |a: &Candidate, b: &Candidate| {
            a.window_requests
                .cmp(&b.window_requests)
                .then_with(|| ledger.in_flight(&a.credential_id).cmp(&ledger.in_flight(&b.credential_id)))
        };

        match strategy {
            Strategy::LeastUsed => {
                candidates.sort_by(least_used);
                false
            }
            Strategy::WeightedCost => {
                candidates.sort_by(|a, b| {
                    a.expected_cost
                        .total_cmp(&b.expected_cost)
                        .then_with(|| least_used(a, b))
                });
                false
            }
            Strategy::RoundRobin => {
                if !candidates.is_empty() {
                    let start = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                    candidates.rotate_left(start);
                }
                false
            }
            Strategy::Sticky => {
                candidates.sort_by(least_used);
                let remembered = criteria
                    .caller_id
                    .as_ref()
                    .and_then(|caller| self.sticky.get(caller).map(|v| v.value().clone()));
                match remembered.and_then(|id| candidates.iter().position(|c| c.credential_id == id)) {
                    Some(index) => {
                        candidates[..=index].rotate_right(1);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::clock::ManualClock;
    use crate::limits::{Admission, Quotas, UsageLedger};
    use crate::router::credential::{CredentialStatus, Provider};

    struct Fixture {
        selector: Selector,
        limiter: RateLimiter,
    }

    fn fixture(credentials: Vec<Credential>) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let pool = Arc::new(CredentialPool::new());
        pool.upsert_provider(Provider::new("openai").with_cost_per_token(0.00003));
        pool.upsert_provider(Provider::new("groq").with_cost_per_token(0.000001));
        pool.upsert_provider(Provider::new("local").with_models(["llama-*"]));
        for credential in credentials {
            pool.add(credential).unwrap();
        }

        let limiter = RateLimiter::new(Arc::new(UsageLedger::new(clock.clone())));
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
            clock,
        ));
        Fixture {
            selector: Selector::new(pool, limiter.clone(), breakers, Strategy::LeastUsed),
            limiter,
        }
    }

    fn use_credential(limiter: &RateLimiter, credential: &Credential, times: usize) {
        for _ in 0..times {
            match limiter.admit(credential, 1) {
                Admission::Admitted(r) => r.commit(1, 10),
                Admission::Denied(d) => panic!("denied: {:?}", d),
            }
        }
    }

    fn ids(decision: &RoutingDecision) -> Vec<&str> {
        decision
            .candidates
            .iter()
            .map(|c| c.credential_id.as_str())
            .collect()
    }

    #[test]
    fn test_least_used_orders_by_window_requests() {
        let a = Credential::new("a", "openai", "s");
        let b = Credential::new("b", "openai", "s");
        let f = fixture(vec![a.clone(), b.clone()]);
        use_credential(&f.limiter, &a, 3);
        use_credential(&f.limiter, &b, 1);

        let decision = f.selector.select(&SelectionCriteria::new()).unwrap();
        assert_eq!(ids(&decision), vec!["b", "a"]);
        assert_eq!(decision.strategy, Strategy::LeastUsed);
    }

    #[test]
    fn test_disabled_and_unpermitted_never_returned() {
        let mut disabled = Credential::new("disabled", "openai", "s");
        disabled.status = CredentialStatus::Disabled;
        let read_only = Credential::new("ro", "openai", "s").with_permissions([Permission::Read]);
        let writer = Credential::new("rw", "openai", "s");
        let f = fixture(vec![disabled, read_only, writer]);

        let criteria = SelectionCriteria::new().with_permissions([Permission::Write]);
        let decision = f.selector.select(&criteria).unwrap();
        assert_eq!(ids(&decision), vec!["rw"]);
    }

    #[test]
    fn test_empty_pool_is_distinct_outcome() {
        let f = fixture(vec![Credential::new("a", "openai", "s")]);
        let criteria = SelectionCriteria::new().with_permissions([Permission::Admin]);

        match f.selector.select(&criteria) {
            Err(RelayError::EmptyPool { reason }) => assert!(reason.contains("1 missing permissions")),
            other => panic!("expected EmptyPool, got {:?}", other.map(|d| d.reason)),
        }
    }

    #[test]
    fn test_model_support_filters_providers() {
        let f = fixture(vec![
            Credential::new("oa", "openai", "s"),
            Credential::new("lo", "local", "s"),
        ]);
        let decision = f
            .selector
            .select(&SelectionCriteria::new().with_model("mistral-7b"))
            .unwrap();
        assert_eq!(ids(&decision), vec!["oa"]);
    }

    #[test]
    fn test_weighted_cost_prefers_cheaper_provider() {
        let f = fixture(vec![
            Credential::new("oa", "openai", "s"),
            Credential::new("gq", "groq", "s"),
        ]);
        let criteria = SelectionCriteria::new()
            .with_strategy(Strategy::WeightedCost)
            .with_estimated_tokens(1_000);

        let decision = f.selector.select(&criteria).unwrap();
        assert_eq!(ids(&decision), vec!["gq", "oa"]);
    }

    #[test]
    fn test_round_robin_rotates_start() {
        let f = fixture(vec![
            Credential::new("a", "openai", "s"),
            Credential::new("b", "openai", "s"),
            Credential::new("c", "openai", "s"),
        ]);
        let criteria = SelectionCriteria::new().with_strategy(Strategy::RoundRobin);

        let firsts: Vec<String> = (0..4)
            .map(|_| f.selector.select(&criteria).unwrap().candidates[0].credential_id.clone())
            .collect();
        assert_eq!(firsts, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_sticky_prefers_last_credential() {
        let a = Credential::new("a", "openai", "s");
        let b = Credential::new("b", "openai", "s");
        let f = fixture(vec![a.clone(), b]);
        use_credential(&f.limiter, &a, 5);

        let criteria = SelectionCriteria::new()
            .with_strategy(Strategy::Sticky)
            .with_caller("team-a");
        assert_eq!(ids(&f.selector.select(&criteria).unwrap()), vec!["b", "a"]);

        f.selector.remember("team-a", "a");
        let decision = f.selector.select(&criteria).unwrap();
        assert_eq!(ids(&decision), vec!["a", "b"]);
        assert!(decision.reason.contains("reusing"));

        f.selector.forget_credential("a");
        assert_eq!(ids(&f.selector.select(&criteria).unwrap()), vec!["b", "a"]);
    }

    #[test]
    fn test_hint_is_a_preference() {
        let f = fixture(vec![
            Credential::new("oa", "openai", "s"),
            Credential::new("gq", "groq", "s"),
        ]);
        let decision = f
            .selector
            .select(&SelectionCriteria::new().with_provider_hint("groq"))
            .unwrap();
        assert_eq!(ids(&decision), vec!["gq", "oa"]);
    }

    #[test]
    fn test_open_breaker_and_exhausted_quota_are_skipped() {
        let limited = Credential::new("limited", "groq", "s")
            .with_quotas(Quotas::unlimited().per_minute(Some(1), None));
        let f = fixture(vec![Credential::new("oa", "openai", "s"), limited.clone()]);

        f.selector
            .breakers()
            .breaker_for("openai", "oa")
            .try_acquire()
            .unwrap()
            .failure();
        use_credential(&f.limiter, &limited, 1);

        let decision = f.selector.select(&SelectionCriteria::new()).unwrap();
        assert!(decision.is_empty());
        assert_eq!(decision.skipped.len(), 2);
        assert_eq!(decision.skipped[0].reason, SkipReason::CircuitOpen);
        assert!(matches!(
            decision.skipped[1].reason,
            SkipReason::RateLimited { window: WindowKind::Minute, .. }
        ));
        assert!(decision.soonest_retry().is_some());
        assert_eq!(decision.confidence, 0.0);
    }
}
