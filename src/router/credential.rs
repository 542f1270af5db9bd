//! Providers and Credentials
//!
//! The configured upstream vendors and the keys that can be used against them.

use crate::clock;
use crate::limits::Quotas;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Operation class a credential may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// An upstream AI vendor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    /// Provider id (e.g. "openai", "groq")
    pub id: String,

    /// Supported model ids. Empty means any model; a trailing `*` matches a prefix.
    #[serde(default)]
    pub models: Vec<String>,

    /// Default cost per token, used by the weighted-cost strategy
    #[serde(default)]
    pub cost_per_token: f64,

    /// Disabled providers contribute no candidates
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Provider {
    /// Create an enabled provider that accepts any model
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            models: Vec::new(),
            cost_per_token: 0.0,
            enabled: true,
        }
    }

    /// Restrict the supported models
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Set the cost per token
    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    /// Whether the provider serves `model`
    pub fn supports(&self, model: &str) -> bool {
        self.models.is_empty()
            || self.models.iter().any(|m| match m.strip_suffix('*') {
                Some(prefix) => model.starts_with(prefix),
                None => m == model,
            })
    }
}

/// A secret value that never shows up in logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short hint such as `sk-...9f2c`
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.masked())
    }
}

/// Administrative status of a credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    #[default]
    Active,
    Disabled,
}

/// Rotation bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationInfo {
    /// Interval between scheduled rotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// When the key should next be rotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_rotation: Option<DateTime<Utc>>,

    /// Until when the previous secret stays valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_end: Option<DateTime<Utc>>,

    /// Last rotation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<DateTime<Utc>>,

    /// Secret replaced by the last rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_secret: Option<Secret>,
}

/// One usable key for a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,

    /// Owning provider
    pub provider_id: String,

    pub secret: Secret,

    #[serde(default)]
    pub permissions: BTreeSet<Permission>,

    #[serde(default)]
    pub quotas: Quotas,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub status: CredentialStatus,

    /// Soft-removed; purged once no reservation is outstanding
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retired: bool,

    #[serde(default)]
    pub rotation: RotationInfo,

    pub created_at: DateTime<Utc>,
}

impl Credential {
    /// Create an active read/write credential without quotas
    pub fn new(id: impl Into<String>, provider_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            secret: Secret::new(secret),
            permissions: [Permission::Read, Permission::Write].into_iter().collect(),
            quotas: Quotas::unlimited(),
            tags: Vec::new(),
            description: String::new(),
            status: CredentialStatus::Active,
            retired: false,
            rotation: RotationInfo::default(),
            created_at: Utc::now(),
        }
    }

    /// Replace the permission set
    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    /// Set quotas
    pub fn with_quotas(mut self, quotas: Quotas) -> Self {
        self.quotas = quotas;
        self
    }

    /// Set tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Schedule rotations every `interval`, starting from `now`
    pub fn with_rotation_interval(mut self, interval: Duration, now: DateTime<Utc>) -> Self {
        self.rotation.interval_secs = Some(interval.as_secs());
        self.rotation.next_rotation = Some(now + clock::to_chrono(interval));
        self
    }

    /// Active and not retired
    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active && !self.retired
    }

    /// Whether the credential grants every permission in `required`
    pub fn grants(&self, required: &BTreeSet<Permission>) -> bool {
        required.is_subset(&self.permissions)
    }

    /// Whether the scheduled rotation time has passed
    pub fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        self.rotation.next_rotation.is_some_and(|at| now >= at)
    }

    /// Swap in a new secret. The old one stays valid for `grace`.
    pub fn rotate(&mut self, new_secret: impl Into<String>, grace: Duration, now: DateTime<Utc>) {
        let old = std::mem::replace(&mut self.secret, Secret::new(new_secret));
        self.rotation.previous_secret = if grace.is_zero() { None } else { Some(old) };
        self.rotation.grace_period_end = (!grace.is_zero()).then(|| now + clock::to_chrono(grace));
        self.rotation.last_rotated = Some(now);
        self.rotation.next_rotation = self
            .rotation
            .interval_secs
            .map(|secs| now + clock::to_chrono(Duration::from_secs(secs)));
    }

    /// Whether `candidate` is the current secret or a previous one still in grace
    pub fn accepts_secret(&self, candidate: &str, now: DateTime<Utc>) -> bool {
        if self.secret.expose() == candidate {
            return true;
        }
        match (&self.rotation.previous_secret, self.rotation.grace_period_end) {
            (Some(previous), Some(end)) => now < end && previous.expose() == candidate,
            _ => false,
        }
    }
}
