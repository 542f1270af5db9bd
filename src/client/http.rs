//! HTTP Connector
//!
//! Generic JSON-over-HTTP upstream connector for OpenAI-compatible endpoints.

use crate::api::{NormalizedRequest, Prompt};
use crate::client::connector::{UpstreamConnector, UpstreamReply};
use crate::client::retry_hint;
use crate::error::{RelayError, Result};
use crate::router::Credential;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Where and how to reach one provider
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub headers: HeaderMap,
}

impl ProviderEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            headers: HeaderMap::new(),
        }
    }

    /// Add an extra header sent with every request
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::try_from(name)
            .map_err(|e| RelayError::Config(format!("Invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RelayError::Config(format!("Invalid value for header '{}': {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    fn url_for(&self, prompt: &Prompt) -> String {
        match prompt {
            Prompt::Messages(_) => format!("{}/chat/completions", self.base_url),
            Prompt::Text(_) => format!("{}/completions", self.base_url),
        }
    }
}

/// Upstream connector speaking the chat/completions JSON dialect
#[derive(Debug)]
pub struct HttpConnector {
    client: Client,
    endpoints: RwLock<HashMap<String, ProviderEndpoint>>,
}

impl HttpConnector {
    /// Create a connector with no registered providers
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    /// Register (or replace) the endpoint of a provider
    pub fn register(&self, provider_id: impl Into<String>, endpoint: ProviderEndpoint) {
        self.endpoints.write().insert(provider_id.into(), endpoint);
    }

    pub fn with_endpoint(self, provider_id: impl Into<String>, endpoint: ProviderEndpoint) -> Self {
        self.register(provider_id, endpoint);
        self
    }

    pub fn endpoint(&self, provider_id: &str) -> Option<ProviderEndpoint> {
        self.endpoints.read().get(provider_id).cloned()
    }

    fn headers(endpoint: &ProviderEndpoint, credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credential.secret.expose()))
                .map_err(|e| RelayError::Config(format!("Invalid API key format: {}", e)))?,
        );
        for (key, value) in &endpoint.headers {
            headers.insert(key.clone(), value.clone());
        }
        Ok(headers)
    }

    fn transport_error(provider: &str, err: reqwest::Error) -> RelayError {
        if err.is_timeout() {
            RelayError::Timeout(format!("{} did not answer in time", provider))
        } else {
            RelayError::Upstream {
                provider: provider.to_string(),
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
                retry_after: None,
            }
        }
    }
}

/// Request body for the upstream: model, prompt and sampling parameters
pub fn request_body(request: &NormalizedRequest) -> Result<Value> {
    let mut body = json!({ "model": request.model });
    if let Some(obj) = body.as_object_mut() {
        match &request.prompt {
            Prompt::Messages(messages) => {
                obj.insert("messages".to_string(), serde_json::to_value(messages)?);
            }
            Prompt::Text(text) => {
                obj.insert("prompt".to_string(), Value::String(text.clone()));
            }
        }
        if let Value::Object(sampling) = serde_json::to_value(&request.sampling)? {
            obj.extend(sampling);
        }
        obj.insert("stream".to_string(), Value::Bool(false));
    }
    Ok(body)
}

/// Total tokens reported under `usage`, if the provider sent any
fn reported_tokens(payload: &Value) -> Option<u64> {
    let usage = payload.get("usage")?;
    usage.get("total_tokens").and_then(Value::as_u64).or_else(|| {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64)?;
        let completion = usage.get("completion_tokens").and_then(Value::as_u64)?;
        Some(prompt + completion)
    })
}

#[async_trait]
impl UpstreamConnector for HttpConnector {
    async fn call(
        &self,
        credential: &Credential,
        request: &NormalizedRequest,
        timeout: Duration,
    ) -> Result<UpstreamReply> {
        let provider = credential.provider_id.as_str();
        let endpoint = self
            .endpoint(provider)
            .ok_or_else(|| RelayError::ProviderNotFound(provider.to_string()))?;

        let url = endpoint.url_for(&request.prompt);
        let headers = Self::headers(&endpoint, credential)?;
        let body = request_body(request)?;

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::transport_error(provider, e))?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let text = response
            .text()
            .await
            .map_err(|e| Self::transport_error(provider, e))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if status.is_success() {
            let payload: Value = serde_json::from_str(&text).map_err(|e| RelayError::Upstream {
                provider: provider.to_string(),
                status: Some(status.as_u16()),
                message: format!(
                    "Failed to parse response: {}. Body: {}",
                    e,
                    text.chars().take(500).collect::<String>()
                ),
                retry_after: None,
            })?;
            let tokens_used = reported_tokens(&payload).unwrap_or(request.estimated_tokens);
            debug!(provider, credential = %credential.id, latency_ms, tokens_used, "Upstream call succeeded");
            return Ok(UpstreamReply {
                success: true,
                latency_ms,
                tokens_used,
                status_code: status.as_u16(),
                payload,
                retry_after: None,
            });
        }

        let retry_after = retry_hint::for_response(status.as_u16(), &response_headers, &text);
        warn!(
            provider,
            credential = %credential.id,
            status = status.as_u16(),
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Upstream call failed"
        );

        let payload = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(UpstreamReply {
            success: false,
            latency_ms,
            tokens_used: 0,
            status_code: status.as_u16(),
            payload,
            retry_after,
        })
    }
}
