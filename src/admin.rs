//! Administrative Operations
//!
//! What a management API needs: inspect and edit credentials, query usage,
//! preview routing, toggle providers, reset breakers, and move configuration
//! in and out. Edits go to the in-memory pool first and are then persisted
//! through the credential store.

use crate::breaker::{BreakerSnapshot, CircuitState};
use crate::clock::SharedClock;
use crate::error::{RelayError, Result};
use crate::limits::{Quotas, WindowKind};
use crate::router::{
    Credential, CredentialStatus, Permission, PoolStats, Provider, RoutingDecision,
    SelectionCriteria, Selector,
};
use crate::store::CredentialStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SNAPSHOT_VERSION: u32 = 1;

/// Credential as shown to operators; the secret is masked
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub id: String,
    pub provider_id: String,
    pub status: CredentialStatus,
    pub retired: bool,
    pub masked_secret: String,
    pub permissions: BTreeSet<Permission>,
    pub quotas: Quotas,
    pub tags: Vec<String>,
    pub description: String,
    pub rotation_due: bool,
    pub next_rotation: Option<DateTime<Utc>>,
    pub in_flight: u64,
    pub minute_requests: u64,
    pub created_at: DateTime<Utc>,
}

/// Provider availability at a glance
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub id: String,
    pub enabled: bool,
    pub breaker: CircuitState,
    pub credentials: usize,
    pub active_credentials: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub generated_at: DateTime<Utc>,
    pub pool: PoolStats,
    pub providers: Vec<ProviderHealth>,
    pub credentials: Vec<CredentialSummary>,
    /// Ids of credentials whose scheduled rotation has passed
    pub rotation_due: Vec<String>,
}

/// One usage window of a credential
#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub window: WindowKind,
    pub window_start: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
    pub requests: u64,
    pub tokens: u64,
    pub request_limit: Option<u64>,
    pub token_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub credential_id: String,
    pub provider_id: String,
    pub windows: Vec<WindowUsage>,
    pub in_flight: u64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub failed_attempts: u64,
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Exported providers and credentials, secrets included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// How an imported snapshot combines with the current state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Add new entries, replace entries with the same id, keep the rest
    #[default]
    Merge,
    /// Credentials missing from the snapshot are removed
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub providers: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Administrative surface over the selector's pool, ledger and breakers
#[derive(Debug)]
pub struct Admin {
    selector: Arc<Selector>,
    store: Arc<dyn CredentialStore>,
    clock: SharedClock,
    rotation_grace: Duration,
}

impl Admin {
    pub fn new(
        selector: Arc<Selector>,
        store: Arc<dyn CredentialStore>,
        clock: SharedClock,
        rotation_grace: Duration,
    ) -> Self {
        Self {
            selector,
            store,
            clock,
            rotation_grace,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Load every stored credential into the pool. Credentials of unknown
    /// providers are skipped.
    pub async fn sync_from_store(&self) -> Result<usize> {
        let pool = self.selector.pool();
        let mut loaded = 0;
        for credential in self.store.load_all().await? {
            let id = credential.id.clone();
            match pool.upsert(credential) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(credential = %id, error = %e, "Stored credential skipped"),
            }
        }
        info!(loaded, "Credentials loaded from store");
        Ok(loaded)
    }

    /// Pool, provider and credential overview
    pub fn overview(&self) -> Overview {
        let pool = self.selector.pool();
        let breakers = self.selector.breakers();
        let credentials = pool.credentials();

        let providers = pool
            .providers()
            .into_iter()
            .map(|provider| {
                let owned: Vec<&Credential> = credentials
                    .iter()
                    .filter(|c| c.provider_id == provider.id)
                    .collect();
                ProviderHealth {
                    breaker: breakers.provider_state(&provider.id),
                    credentials: owned.len(),
                    active_credentials: owned.iter().filter(|c| c.is_active()).count(),
                    enabled: provider.enabled,
                    id: provider.id,
                }
            })
            .collect();

        let summaries: Vec<CredentialSummary> =
            credentials.iter().map(|c| self.summarize(c)).collect();
        let rotation_due = summaries
            .iter()
            .filter(|s| s.rotation_due)
            .map(|s| s.id.clone())
            .collect();

        Overview {
            generated_at: self.clock.now(),
            pool: pool.stats(),
            providers,
            credentials: summaries,
            rotation_due,
        }
    }

    pub fn get_credential(&self, id: &str) -> Result<CredentialSummary> {
        self.selector
            .pool()
            .get(id)
            .map(|c| self.summarize(&c))
            .ok_or_else(|| RelayError::CredentialNotFound(id.to_string()))
    }

    /// Add a new credential. Fails on an unknown provider or a taken id.
    pub async fn add_credential(&self, credential: Credential) -> Result<CredentialSummary> {
        let pool = self.selector.pool();
        pool.add(credential.clone())?;
        if let Err(e) = self.store.put(&credential).await {
            pool.remove(&credential.id);
            return Err(e);
        }
        info!(credential = %credential.id, provider = %credential.provider_id, "Credential added");
        Ok(self.summarize(&credential))
    }

    /// Replace a credential's secret. The previous secret stays valid for
    /// the configured grace period.
    pub async fn rotate_credential(&self, id: &str, new_secret: impl Into<String>) -> Result<CredentialSummary> {
        let now = self.clock.now();
        let grace = self.rotation_grace;
        let new_secret = new_secret.into();
        if new_secret.trim().is_empty() {
            return Err(RelayError::Config("New secret must not be empty".to_string()));
        }

        let updated = self
            .selector
            .pool()
            .update(id, |c| c.rotate(new_secret, grace, now))?;
        self.store.put(&updated).await?;
        info!(credential = %id, grace_secs = grace.as_secs(), "Credential rotated");
        Ok(self.summarize(&updated))
    }

    pub async fn disable_credential(&self, id: &str) -> Result<CredentialSummary> {
        let updated = self
            .selector
            .pool()
            .update(id, |c| c.status = CredentialStatus::Disabled)?;
        self.selector.forget_credential(id);
        self.store.put(&updated).await?;
        info!(credential = %id, "Credential disabled");
        Ok(self.summarize(&updated))
    }

    pub async fn enable_credential(&self, id: &str) -> Result<CredentialSummary> {
        let pool = self.selector.pool();
        let current = pool
            .get(id)
            .ok_or_else(|| RelayError::CredentialNotFound(id.to_string()))?;
        if current.retired {
            return Err(RelayError::Config(format!(
                "Credential '{}' has been removed and cannot be re-enabled",
                id
            )));
        }

        let updated = pool.update(id, |c| c.status = CredentialStatus::Active)?;
        self.store.put(&updated).await?;
        info!(credential = %id, "Credential enabled");
        Ok(self.summarize(&updated))
    }

    /// Retire a credential. It stops receiving traffic at once and is purged
    /// when no reservation is outstanding. Returns whether it was purged now.
    pub async fn remove_credential(&self, id: &str) -> Result<bool> {
        let updated = self.selector.pool().update(id, |c| {
            c.status = CredentialStatus::Disabled;
            c.retired = true;
        })?;
        self.selector.forget_credential(id);
        self.store.put(&updated).await?;

        let purged = self.purge_retired().await?.iter().any(|p| p == id);
        info!(credential = %id, purged, "Credential retired");
        Ok(purged)
    }

    /// Purge retired credentials without in-flight reservations
    pub async fn purge_retired(&self) -> Result<Vec<String>> {
        let pool = self.selector.pool();
        let ledger = self.selector.limiter().ledger();

        let mut purged = Vec::new();
        for credential in pool.credentials().into_iter().filter(|c| c.retired) {
            if ledger.in_flight(&credential.id) > 0 {
                continue;
            }
            self.store.delete(&credential.id).await?;
            pool.remove(&credential.id);
            ledger.remove(&credential.id);
            purged.push(credential.id);
        }
        Ok(purged)
    }

    /// Window and lifetime usage of a credential
    pub fn usage_stats(&self, id: &str) -> Result<UsageStats> {
        let credential = self
            .selector
            .pool()
            .get(id)
            .ok_or_else(|| RelayError::CredentialNotFound(id.to_string()))?;

        let stats = self.selector.limiter().ledger().inspect(id, |usage, _| {
            let windows = WindowKind::ALL
                .iter()
                .map(|&kind| {
                    let counter = usage.counter(kind);
                    let quota = credential.quotas.get(kind);
                    WindowUsage {
                        window: kind,
                        window_start: counter.window_start,
                        resets_at: kind.end_of(counter.window_start),
                        requests: counter.requests,
                        tokens: counter.tokens,
                        request_limit: quota.requests,
                        token_limit: quota.tokens,
                    }
                })
                .collect();
            UsageStats {
                credential_id: credential.id.clone(),
                provider_id: credential.provider_id.clone(),
                windows,
                in_flight: usage.in_flight,
                total_requests: usage.total_requests,
                total_tokens: usage.total_tokens,
                failed_attempts: usage.failed_attempts,
                avg_latency_ms: usage.avg_latency_ms,
                last_used: usage.last_used,
            }
        });
        Ok(stats)
    }

    /// What the selector would pick for these criteria, without reserving
    pub fn preview_selection(&self, criteria: &SelectionCriteria) -> Result<RoutingDecision> {
        self.selector.select(criteria)
    }

    pub fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> Result<()> {
        self.selector.pool().set_provider_enabled(provider_id, enabled)?;
        info!(provider = %provider_id, enabled, "Provider toggled");
        Ok(())
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.selector.breakers().snapshots()
    }

    /// Close a provider's (or credential's) breaker by hand. Returns how many
    /// breakers were reset.
    pub fn reset_breaker(&self, key: &str) -> usize {
        let reset = self.selector.breakers().reset(key);
        info!(key, reset, "Breaker reset");
        reset
    }

    pub fn reset_all_breakers(&self) {
        self.selector.breakers().reset_all();
        info!("All breakers reset");
    }

    /// Providers and credentials as a portable snapshot
    pub fn export_config(&self) -> ConfigSnapshot {
        let pool = self.selector.pool();
        ConfigSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: self.clock.now(),
            providers: pool.providers(),
            credentials: pool.credentials(),
        }
    }

    /// Apply a snapshot. The snapshot is checked as a whole before anything
    /// changes.
    pub async fn import_config(&self, snapshot: ConfigSnapshot, mode: ImportMode) -> Result<ImportReport> {
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(RelayError::Config(format!(
                "Snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let pool = self.selector.pool();
        let incoming_providers: HashSet<&str> =
            snapshot.providers.iter().map(|p| p.id.as_str()).collect();
        let mut seen = HashSet::new();
        for credential in &snapshot.credentials {
            if !seen.insert(credential.id.as_str()) {
                return Err(RelayError::DuplicateCredential(credential.id.clone()));
            }
            if !incoming_providers.contains(credential.provider_id.as_str())
                && !pool.is_provider(&credential.provider_id)
            {
                return Err(RelayError::ProviderNotFound(credential.provider_id.clone()));
            }
        }

        let mut report = ImportReport {
            providers: snapshot.providers.len(),
            ..ImportReport::default()
        };
        for provider in snapshot.providers {
            pool.upsert_provider(provider);
        }

        if mode == ImportMode::Replace {
            for existing in pool.credentials() {
                if seen.contains(existing.id.as_str()) || existing.retired {
                    continue;
                }
                pool.update(&existing.id, |c| {
                    c.status = CredentialStatus::Disabled;
                    c.retired = true;
                })?;
                self.selector.forget_credential(&existing.id);
                report.removed += 1;
            }
        }

        for credential in &snapshot.credentials {
            if pool.get(&credential.id).is_some() {
                report.updated += 1;
            } else {
                report.added += 1;
            }
            pool.upsert(credential.clone())?;
        }

        match mode {
            ImportMode::Replace => {
                self.store.replace_all(&pool.credentials()).await?;
                self.purge_retired().await?;
            }
            ImportMode::Merge => {
                for credential in &snapshot.credentials {
                    self.store.put(credential).await?;
                }
            }
        }

        info!(
            mode = ?mode,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            "Configuration imported"
        );
        Ok(report)
    }

    fn summarize(&self, credential: &Credential) -> CredentialSummary {
        let ledger = self.selector.limiter().ledger();
        CredentialSummary {
            id: credential.id.clone(),
            provider_id: credential.provider_id.clone(),
            status: credential.status,
            retired: credential.retired,
            masked_secret: credential.secret.masked(),
            permissions: credential.permissions.clone(),
            quotas: credential.quotas,
            tags: credential.tags.clone(),
            description: credential.description.clone(),
            rotation_due: credential.rotation_due(self.clock.now()),
            next_rotation: credential.rotation.next_rotation,
            in_flight: ledger.in_flight(&credential.id),
            minute_requests: ledger.window_requests(&credential.id, WindowKind::Minute),
            created_at: credential.created_at,
        }
    }
}
