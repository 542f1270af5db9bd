//! Upstream Connector
//!
//! The seam between the dispatch core and a provider. The core only reads
//! the outcome fields; `payload` is passed through untouched.

use crate::api::NormalizedRequest;
use crate::error::{RelayError, Result};
use crate::router::Credential;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one upstream call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamReply {
    pub success: bool,
    pub latency_ms: u64,
    pub tokens_used: u64,
    pub status_code: u16,

    /// Provider response body, opaque to the core
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Delay the provider asked for on a failed reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl UpstreamReply {
    pub fn ok(payload: serde_json::Value, tokens_used: u64, latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            tokens_used,
            status_code: 200,
            payload,
            retry_after: None,
        }
    }

    pub fn failed(status_code: u16, latency_ms: u64) -> Self {
        Self {
            success: false,
            latency_ms,
            tokens_used: 0,
            status_code,
            payload: serde_json::Value::Null,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// One upstream call per attempt. Implementations must honour `timeout`
/// where they can; the dispatcher enforces it regardless.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + Debug {
    async fn call(
        &self,
        credential: &Credential,
        request: &NormalizedRequest,
        timeout: Duration,
    ) -> Result<UpstreamReply>;
}

/// Routes each call to the connector registered for the credential's
/// provider, falling back to a default one.
#[derive(Debug, Default)]
pub struct ConnectorRouter {
    routes: RwLock<HashMap<String, Arc<dyn UpstreamConnector>>>,
    fallback: Option<Arc<dyn UpstreamConnector>>,
}

impl ConnectorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector used for providers without their own route
    pub fn with_fallback(mut self, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.fallback = Some(connector);
        self
    }

    pub fn with_route(self, provider_id: impl Into<String>, connector: Arc<dyn UpstreamConnector>) -> Self {
        self.route(provider_id, connector);
        self
    }

    /// Register (or replace) the connector of a provider
    pub fn route(&self, provider_id: impl Into<String>, connector: Arc<dyn UpstreamConnector>) {
        self.routes.write().insert(provider_id.into(), connector);
    }

    pub fn connector_for(&self, provider_id: &str) -> Option<Arc<dyn UpstreamConnector>> {
        self.routes
            .read()
            .get(provider_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl UpstreamConnector for ConnectorRouter {
    async fn call(
        &self,
        credential: &Credential,
        request: &NormalizedRequest,
        timeout: Duration,
    ) -> Result<UpstreamReply> {
        let connector = self
            .connector_for(&credential.provider_id)
            .ok_or_else(|| RelayError::ProviderNotFound(credential.provider_id.clone()))?;
        connector.call(credential, request, timeout).await
    }
}
