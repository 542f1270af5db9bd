//! Credential Pool
//!
//! In-memory view of the configured providers and their credentials. Request
//! handling only ever reads this view; the credential store is consulted at
//! startup and by administrative operations.

use crate::error::{RelayError, Result};
use crate::router::credential::{Credential, CredentialStatus, Provider};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Pool of providers and credentials
#[derive(Debug, Default)]
pub struct CredentialPool {
    /// Providers keyed by id
    providers: RwLock<BTreeMap<String, Provider>>,

    /// Credentials in insertion order
    credentials: RwLock<Vec<Credential>>,
}

impl CredentialPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a provider
    pub fn upsert_provider(&self, provider: Provider) {
        self.providers.write().insert(provider.id.clone(), provider);
    }

    /// Provider by id
    pub fn provider(&self, id: &str) -> Option<Provider> {
        self.providers.read().get(id).cloned()
    }

    /// All providers, sorted by id
    pub fn providers(&self) -> Vec<Provider> {
        self.providers.read().values().cloned().collect()
    }

    /// Whether `id` names a configured provider
    pub fn is_provider(&self, id: &str) -> bool {
        self.providers.read().contains_key(id)
    }

    /// Enable or disable a provider
    pub fn set_provider_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut providers = self.providers.write();
        let provider = providers
            .get_mut(id)
            .ok_or_else(|| RelayError::ProviderNotFound(id.to_string()))?;
        provider.enabled = enabled;
        Ok(())
    }

    /// Add a credential; its provider must exist and its id must be new
    pub fn add(&self, credential: Credential) -> Result<()> {
        if !self.is_provider(&credential.provider_id) {
            return Err(RelayError::ProviderNotFound(credential.provider_id));
        }

        let mut credentials = self.credentials.write();
        if credentials.iter().any(|c| c.id == credential.id) {
            return Err(RelayError::DuplicateCredential(credential.id));
        }
        credentials.push(credential);
        Ok(())
    }

    /// Insert or replace a credential by id
    pub fn upsert(&self, credential: Credential) -> Result<()> {
        if !self.is_provider(&credential.provider_id) {
            return Err(RelayError::ProviderNotFound(credential.provider_id));
        }

        let mut credentials = self.credentials.write();
        match credentials.iter_mut().find(|c| c.id == credential.id) {
            Some(existing) => *existing = credential,
            None => credentials.push(credential),
        }
        Ok(())
    }

    /// Credential by id
    pub fn get(&self, id: &str) -> Option<Credential> {
        self.credentials.read().iter().find(|c| c.id == id).cloned()
    }

    /// Apply `f` to a credential and return the updated copy
    pub fn update<F>(&self, id: &str, f: F) -> Result<Credential>
    where
        F: FnOnce(&mut Credential),
    {
        let mut credentials = self.credentials.write();
        let credential = credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RelayError::CredentialNotFound(id.to_string()))?;
        f(credential);
        Ok(credential.clone())
    }

    /// Hard-remove a credential
    pub fn remove(&self, id: &str) -> Option<Credential> {
        let mut credentials = self.credentials.write();
        let index = credentials.iter().position(|c| c.id == id)?;
        Some(credentials.remove(index))
    }

    /// Snapshot of all credentials in insertion order
    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials.read().clone()
    }

    /// Credentials of one provider
    pub fn credentials_for(&self, provider_id: &str) -> Vec<Credential> {
        self.credentials
            .read()
            .iter()
            .filter(|c| c.provider_id == provider_id)
            .cloned()
            .collect()
    }

    /// Get statistics about the pool
    pub fn stats(&self) -> PoolStats {
        let credentials = self.credentials.read();
        let providers = self.providers.read();

        PoolStats {
            total_credentials: credentials.len(),
            active_credentials: credentials.iter().filter(|c| c.is_active()).count(),
            disabled_credentials: credentials
                .iter()
                .filter(|c| c.status == CredentialStatus::Disabled && !c.retired)
                .count(),
            retired_credentials: credentials.iter().filter(|c| c.retired).count(),
            total_providers: providers.len(),
            enabled_providers: providers.values().filter(|p| p.enabled).count(),
        }
    }
}

/// Statistics about a credential pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_credentials: usize,
    pub active_credentials: usize,
    pub disabled_credentials: usize,
    pub retired_credentials: usize,
    pub total_providers: usize,
    pub enabled_providers: usize,
}
