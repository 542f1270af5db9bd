//! In-memory credential store

use crate::error::Result;
use crate::router::Credential;
use crate::store::CredentialStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Process-local store, used in tests and when no persistence is configured
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<BTreeMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `credentials`
    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let store = Self::new();
        {
            let mut map = store.credentials.write();
            for credential in credentials {
                map.insert(credential.id.clone(), credential);
            }
        }
        store
    }

    pub fn len(&self) -> usize {
        self.credentials.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.read().is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_all(&self) -> Result<Vec<Credential>> {
        Ok(self.credentials.read().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.read().get(id).cloned())
    }

    async fn put(&self, credential: &Credential) -> Result<()> {
        self.credentials
            .write()
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.credentials.write().remove(id).is_some())
    }

    async fn replace_all(&self, credentials: &[Credential]) -> Result<()> {
        let mut map = self.credentials.write();
        map.clear();
        for credential in credentials {
            map.insert(credential.id.clone(), credential.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryCredentialStore::new();
        let credential = Credential::new("k1", "openai", "sk-one");

        store.put(&credential).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some(credential));
        assert!(store.delete("k1").await.unwrap());
        assert!(!store.delete("k1").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_load_all_is_ordered_by_id() {
        let store = MemoryCredentialStore::with_credentials([
            Credential::new("b", "openai", "sk-b"),
            Credential::new("a", "openai", "sk-a"),
        ]);
        let ids: Vec<_> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
