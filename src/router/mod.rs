//! Router Module
//!
//! Providers, credentials, the credential pool and the selector that ranks
//! credentials for each request.

pub mod credential;
pub mod pool;
pub mod selector;
pub mod strategy;

pub use credential::{
    Credential, CredentialStatus, Permission, Provider, RotationInfo, Secret,
};
pub use pool::{CredentialPool, PoolStats};
pub use selector::{
    Candidate, RoutingDecision, SelectionCriteria, Selector, SkipReason, SkippedCandidate,
};
pub use strategy::{ModelRoute, Strategy};
