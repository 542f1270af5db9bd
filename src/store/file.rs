//! JSON File Credential Store
//!
//! Whole-file persistence: every write rewrites the document through a
//! temp file and a rename.

use crate::error::{RelayError, Result};
use crate::router::Credential;
use crate::store::CredentialStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    version: u32,

    #[serde(default)]
    credentials: Vec<Credential>,
}

/// Credential store backed by one JSON file
#[derive(Debug)]
pub struct JsonFileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `<config_dir>/keyrelay/credentials.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|c| c.join("keyrelay"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("credentials.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<Credential>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let doc: StoreDocument = serde_json::from_str(&content).map_err(|e| {
            RelayError::Store(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        if doc.version > FORMAT_VERSION {
            return Err(RelayError::Store(format!(
                "{} has format version {}, newest supported is {}",
                self.path.display(),
                doc.version,
                FORMAT_VERSION
            )));
        }
        Ok(doc.credentials)
    }

    async fn write(&self, mut credentials: Vec<Credential>) -> Result<()> {
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        let doc = StoreDocument {
            version: FORMAT_VERSION,
            credentials,
        };
        let json = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        set_owner_only(&temp_path).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), count = doc.credentials.len(), "Credential store saved");
        Ok(())
    }

    async fn modify<R>(&self, f: impl FnOnce(&mut Vec<Credential>) -> R) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let mut credentials = self.read().await?;
        let out = f(&mut credentials);
        self.write(credentials).await?;
        Ok(out)
    }
}

/// Credentials hold secrets: owner read/write only
#[cfg(unix)]
async fn set_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl CredentialStore for JsonFileCredentialStore {
    async fn load_all(&self) -> Result<Vec<Credential>> {
        let mut credentials = self.read().await?;
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(credentials)
    }

    async fn get(&self, id: &str) -> Result<Option<Credential>> {
        Ok(self.read().await?.into_iter().find(|c| c.id == id))
    }

    async fn put(&self, credential: &Credential) -> Result<()> {
        self.modify(|credentials| {
            match credentials.iter_mut().find(|c| c.id == credential.id) {
                Some(existing) => *existing = credential.clone(),
                None => credentials.push(credential.clone()),
            }
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.modify(|credentials| {
            let before = credentials.len();
            credentials.retain(|c| c.id != id);
            credentials.len() != before
        })
        .await
    }

    async fn replace_all(&self, credentials: &[Credential]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(credentials.to_vec()).await
    }
}
