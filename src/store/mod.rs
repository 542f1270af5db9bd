//! Credential Store
//!
//! Persistence for credentials. The dispatch path never touches a store;
//! it is read at startup and written by administrative operations.

pub mod file;
pub mod memory;

pub use file::JsonFileCredentialStore;
pub use memory::MemoryCredentialStore;

use crate::error::Result;
use crate::router::Credential;
use async_trait::async_trait;
use std::fmt::Debug;

/// CRUD over persisted credentials
#[async_trait]
pub trait CredentialStore: Send + Sync + Debug {
    /// All stored credentials, ordered by id
    async fn load_all(&self) -> Result<Vec<Credential>>;

    /// Fetch a credential by id
    async fn get(&self, id: &str) -> Result<Option<Credential>>;

    /// Insert or replace a credential
    async fn put(&self, credential: &Credential) -> Result<()>;

    /// Delete a credential. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Replace the whole contents
    async fn replace_all(&self, credentials: &[Credential]) -> Result<()>;
}
