//! Inbound Requests
//!
//! The request descriptor handed to the core by the surrounding gateway, its
//! normalized form, and the fingerprint used as the response cache key.

use crate::queue::Priority;
use crate::router::{ModelRoute, Permission, Strategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", "assistant", or "tool"
    pub role: String,

    /// Message content (can be string or array of content parts)
    pub content: MessageContent,

    /// Optional name for the message author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Shorthand for a plain-text message
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
            name: None,
        }
    }

    /// Shorthand for a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }
}

/// Message content - can be a simple string or array of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple string content
    Text(String),

    /// Array of content parts (for multimodal)
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// True when every part is text, so the parts can be flattened losslessly
    fn is_text_only(&self) -> bool {
        match self {
            MessageContent::Text(_) => true,
            MessageContent::Parts(parts) => {
                parts.iter().all(|p| matches!(p, ContentPart::Text { .. }))
            }
        }
    }

    /// Convert to string (concatenating text parts)
    pub fn to_string_content(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

/// A content part in a message (for multimodal content)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    /// Text content
    #[serde(rename = "text")]
    Text { text: String },

    /// Image content
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// URL or base64 data URL
    pub url: String,

    /// Optional detail level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Either a raw prompt or a message sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// Legacy single-string completion prompt
    Text(String),

    /// Chat message sequence
    Messages(Vec<Message>),
}

/// Sampling parameters that influence the generated output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Additional provider-agnostic parameters, kept sorted for stable hashing
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Request descriptor as received from the gateway/auth layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Authenticated caller (used for sticky routing)
    pub caller_id: String,

    /// Permissions the selected credential must grant
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// Preferred provider, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_hint: Option<String>,

    /// Model identifier, optionally prefixed with a provider ("openai/gpt-4o")
    pub model: String,

    /// Prompt text or message sequence
    #[serde(alias = "messages", alias = "prompt_or_messages")]
    pub prompt: Prompt,

    /// Sampling parameters
    #[serde(default)]
    pub sampling: SamplingParams,

    /// Caller's estimate of total tokens (prompt + completion)
    #[serde(default)]
    pub estimated_tokens: f64,

    /// Streaming responses are never cached
    #[serde(default)]
    pub streaming: bool,

    /// Requests with side effects opt out of caching
    #[serde(default)]
    pub no_cache: bool,

    /// Priority if the request ends up in the overflow queue
    #[serde(default)]
    pub priority: Priority,

    /// Selection strategy override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
}

impl InboundRequest {
    /// Create a chat request with default sampling
    pub fn new(caller_id: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            caller_id: caller_id.into(),
            permissions: Vec::new(),
            provider_hint: None,
            model: model.into(),
            prompt: Prompt::Messages(messages),
            sampling: SamplingParams::default(),
            estimated_tokens: 0.0,
            streaming: false,
            no_cache: false,
            priority: Priority::default(),
            strategy: None,
        }
    }

    /// Set required permissions
    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.permissions = permissions.into_iter().collect();
        self
    }

    /// Set the provider hint
    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.sampling.max_tokens = Some(max_tokens);
        self
    }

    /// Set the token estimate
    pub fn with_estimated_tokens(mut self, tokens: f64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Enable streaming
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.streaming = stream;
        self
    }

    /// Set queue priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the selection strategy
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Normalize the request.
    ///
    /// `is_provider` decides whether a `prefix/` on the model names a known
    /// provider (model ids such as `meta-llama/Llama-3` legitimately contain
    /// slashes).
    pub fn normalize(&self, is_provider: impl Fn(&str) -> bool) -> NormalizedRequest {
        let mut model = self.model.trim().to_string();
        let mut provider_hint = self
            .provider_hint
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        if let Ok(route) = ModelRoute::parse(&model) {
            if is_provider(&route.provider) {
                if provider_hint.is_none() {
                    provider_hint = Some(route.provider.clone());
                }
                model = route.model_id();
            }
        }

        let prompt = match &self.prompt {
            Prompt::Text(text) => Prompt::Text(text.clone()),
            Prompt::Messages(messages) => Prompt::Messages(
                messages
                    .iter()
                    .map(|m| Message {
                        role: m.role.trim().to_lowercase(),
                        content: if m.content.is_text_only() {
                            MessageContent::Text(m.content.to_string_content())
                        } else {
                            m.content.clone()
                        },
                        name: m.name.clone(),
                    })
                    .collect(),
            ),
        };

        let estimated_tokens = if self.estimated_tokens.is_finite() && self.estimated_tokens > 0.0 {
            self.estimated_tokens.ceil() as u64
        } else {
            0
        };

        NormalizedRequest {
            caller_id: self.caller_id.clone(),
            permissions: self.permissions.iter().copied().collect(),
            provider_hint,
            model,
            prompt,
            sampling: self.sampling.clone(),
            estimated_tokens,
            streaming: self.streaming,
            cacheable: !self.streaming && !self.no_cache,
            priority: self.priority,
            strategy: self.strategy,
        }
    }
}

/// Request after normalization; this is what connectors receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub caller_id: String,
    pub permissions: BTreeSet<Permission>,
    pub provider_hint: Option<String>,
    pub model: String,
    pub prompt: Prompt,
    pub sampling: SamplingParams,
    /// Token estimate, rounded up
    pub estimated_tokens: u64,
    pub streaming: bool,
    pub cacheable: bool,
    pub priority: Priority,
    pub strategy: Option<Strategy>,
}

/// The fields that define "the same request" for caching purposes
#[derive(Serialize)]
struct FingerprintInput<'a> {
    provider: Option<&'a str>,
    model: &'a str,
    prompt: &'a Prompt,
    sampling: &'a SamplingParams,
}

impl NormalizedRequest {
    /// Deterministic SHA-256 fingerprint over provider hint, model, prompt
    /// and sampling parameters
    pub fn fingerprint(&self) -> Fingerprint {
        let input = FingerprintInput {
            provider: self.provider_hint.as_deref(),
            model: &self.model,
            prompt: &self.prompt,
            sampling: &self.sampling,
        };
        // Serializing plain data structs into a Vec cannot fail.
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}

/// Hex-encoded request fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Fingerprint(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(p: &str) -> bool {
        matches!(p, "openai" | "groq")
    }

    fn request() -> InboundRequest {
        InboundRequest::new("caller-1", "gpt-4o", vec![Message::user("Hello")])
            .with_temperature(0.2)
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = request().normalize(known).fingerprint();
        let b = request().normalize(known).fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_sampling_params_change_fingerprint() {
        let base = request().normalize(known).fingerprint();
        let warmer = request().with_temperature(0.9).normalize(known).fingerprint();
        let capped = request().with_max_tokens(16).normalize(known).fingerprint();

        let mut seeded = request();
        seeded.sampling.seed = Some(7);
        let seeded = seeded.normalize(known).fingerprint();

        assert_ne!(base, warmer);
        assert_ne!(base, capped);
        assert_ne!(base, seeded);
        assert_ne!(warmer, capped);
    }

    #[test]
    fn test_messages_and_model_change_fingerprint() {
        let base = request().normalize(known).fingerprint();

        let mut other_prompt = request();
        other_prompt.prompt = Prompt::Messages(vec![Message::user("Hello!")]);
        assert_ne!(base, other_prompt.normalize(known).fingerprint());

        let mut other_model = request();
        other_model.model = "gpt-4o-mini".to_string();
        assert_ne!(base, other_model.normalize(known).fingerprint());
    }

    #[test]
    fn test_caller_does_not_affect_fingerprint() {
        let mut other_caller = request();
        other_caller.caller_id = "caller-2".to_string();
        assert_eq!(
            request().normalize(known).fingerprint(),
            other_caller.normalize(known).fingerprint()
        );
    }

    #[test]
    fn test_provider_prefix_becomes_hint() {
        let mut req = request();
        req.model = "groq/llama-3.1-70b".to_string();
        let normalized = req.normalize(known);
        assert_eq!(normalized.provider_hint.as_deref(), Some("groq"));
        assert_eq!(normalized.model, "llama-3.1-70b");

        // Unknown prefixes are part of the model id
        let mut req = request();
        req.model = "meta-llama/Llama-3".to_string();
        let normalized = req.normalize(known);
        assert_eq!(normalized.provider_hint, None);
        assert_eq!(normalized.model, "meta-llama/Llama-3");
    }

    #[test]
    fn test_provider_prefix_changes_fingerprint() {
        let routed = |model: &str| {
            let mut req = request();
            req.model = model.to_string();
            req.normalize(known)
        };
        let groq = routed("groq/llama-3.1-70b");
        let openai = routed("openai/llama-3.1-70b");
        assert_eq!(groq.model, openai.model);
        assert_ne!(groq.fingerprint(), openai.fingerprint());

        let hinted = request().with_provider_hint("groq").normalize(known);
        let mut prefixed = request();
        prefixed.model = "groq/gpt-4o".to_string();
        assert_eq!(hinted.fingerprint(), prefixed.normalize(known).fingerprint());
    }

    #[test]
    fn test_short_fingerprint_respects_char_boundaries() {
        let fp = Fingerprint::from("ééééééééééééééé");
        assert_eq!(fp.short(), "éééééééééééé");

        let fp = Fingerprint::from("abc");
        assert_eq!(fp.short(), "abc");

        let hex = request().normalize(known).fingerprint();
        assert_eq!(hex.short().len(), 12);
        assert!(hex.as_str().starts_with(hex.short()));
    }

    #[test]
    fn test_text_parts_are_flattened() {
        let parts = InboundRequest::new(
            "c",
            "gpt-4o",
            vec![Message {
                role: "User".to_string(),
                content: MessageContent::Parts(vec![
                    ContentPart::Text { text: "Hel".to_string() },
                    ContentPart::Text { text: "lo".to_string() },
                ]),
                name: None,
            }],
        )
        .with_temperature(0.2);

        assert_eq!(
            parts.normalize(known).fingerprint(),
            request().normalize(known).fingerprint()
        );
    }

    #[test]
    fn test_estimate_rounds_up_and_streaming_disables_cache() {
        let normalized = request()
            .with_estimated_tokens(10.2)
            .with_stream(true)
            .normalize(known);
        assert_eq!(normalized.estimated_tokens, 11);
        assert!(!normalized.cacheable);
    }

    #[test]
    fn test_deserialize_descriptor() {
        let json = r#"{
            "caller_id": "team-a",
            "permissions": ["read", "write"],
            "model": "openai/gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "sampling": {"temperature": 0.5, "logit_bias": {"50256": -100}},
            "estimated_tokens": 42.5
        }"#;

        let req: InboundRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.permissions, vec![Permission::Read, Permission::Write]);
        assert!(req.sampling.extra.contains_key("logit_bias"));
        assert_eq!(req.normalize(known).estimated_tokens, 43);
    }
}
