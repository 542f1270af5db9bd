//! Provider and Credential Configuration
//!
//! Defines the configuration schema for providers and their credentials.

use crate::client::ProviderEndpoint;
use crate::error::Result;
use crate::limits::Quotas;
use crate::router::{Credential, Permission, Provider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for a single upstream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL for the API
    pub base_url: String,

    /// Optional environment variable overriding `base_url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url_env: Option<String>,

    /// Supported models; empty means any. `prefix*` matches by prefix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Price per token, used by the weighted-cost strategy
    #[serde(default)]
    pub cost_per_token: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Additional headers to send with requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            base_url_env: None,
            models: Vec::new(),
            cost_per_token: 0.0,
            enabled: true,
            headers: BTreeMap::new(),
        }
    }

    /// Get the effective base URL (from env var if configured, otherwise default)
    pub fn get_base_url(&self) -> String {
        if let Some(env_var) = &self.base_url_env {
            if let Ok(url) = std::env::var(env_var) {
                return url;
            }
        }
        self.base_url.clone()
    }

    /// Routing view of this provider
    pub fn to_provider(&self, id: &str) -> Provider {
        let mut provider = Provider::new(id)
            .with_models(self.models.iter().cloned())
            .with_cost_per_token(self.cost_per_token);
        provider.enabled = self.enabled;
        provider
    }

    /// Connection details for the HTTP connector
    pub fn to_endpoint(&self) -> Result<ProviderEndpoint> {
        self.headers
            .iter()
            .try_fold(ProviderEndpoint::new(self.get_base_url()), |endpoint, (k, v)| {
                endpoint.with_header(k, v)
            })
    }
}

/// One credential entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub id: String,

    /// Owning provider id
    pub provider: String,

    /// Raw secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Environment variable holding the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,

    #[serde(default = "default_permissions")]
    pub permissions: Vec<Permission>,

    /// Unset windows inherit `default_quotas`
    #[serde(default)]
    pub quotas: Quotas,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_interval_secs: Option<u64>,
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::Read, Permission::Write]
}

impl CredentialConfig {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            key: None,
            key_env: None,
            permissions: default_permissions(),
            quotas: Quotas::default(),
            tags: Vec::new(),
            description: String::new(),
            rotation_interval_secs: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_key_env(mut self, var: impl Into<String>) -> Self {
        self.key_env = Some(var.into());
        self
    }

    /// The secret: `key` first, then the `key_env` variable
    pub fn resolve_secret(&self) -> Option<String> {
        self.key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.key_env
                    .as_ref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.is_empty())
            })
    }

    /// Build the runtime credential. `None` when no secret resolves.
    pub fn to_credential(&self, default_quotas: &Quotas, now: DateTime<Utc>) -> Option<Credential> {
        let secret = self.resolve_secret()?;
        let mut credential = Credential::new(&self.id, &self.provider, secret)
            .with_permissions(self.permissions.iter().copied())
            .with_quotas(self.quotas.or(default_quotas))
            .with_tags(self.tags.iter().cloned())
            .with_description(&self.description);
        credential.created_at = now;
        if let Some(secs) = self.rotation_interval_secs.filter(|s| *s > 0) {
            credential = credential.with_rotation_interval(Duration::from_secs(secs), now);
        }
        Some(credential)
    }

    /// Config entry describing an existing credential, secret included
    pub fn from_credential(credential: &Credential) -> Self {
        Self {
            id: credential.id.clone(),
            provider: credential.provider_id.clone(),
            key: Some(credential.secret.expose().to_string()),
            key_env: None,
            permissions: credential.permissions.iter().copied().collect(),
            quotas: credential.quotas,
            tags: credential.tags.clone(),
            description: credential.description.clone(),
            rotation_interval_secs: credential.rotation.interval_secs,
        }
    }
}
