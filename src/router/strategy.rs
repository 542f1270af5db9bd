//! Routing Strategies
//!
//! Parsing of provider-prefixed model identifiers and the closed set of
//! credential ranking strategies.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed model identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    /// Provider name (e.g., "openai", "groq")
    pub provider: String,

    /// Model name (e.g., "gpt-4", "llama-3.1-70b")
    pub model: String,

    /// Optional variant/deployment (e.g., for Azure deployments)
    pub variant: Option<String>,
}

impl ModelRoute {
    /// Parse a model string in the format "provider/model" or "provider/model/variant"
    pub fn parse(model_string: &str) -> Result<Self> {
        let parts: Vec<&str> = model_string.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid(model_string));
        }

        match parts.as_slice() {
            [provider, model] => Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
                variant: None,
            }),
            [provider, model, variant] => Ok(Self {
                provider: provider.to_string(),
                model: model.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(invalid(model_string)),
        }
    }

    /// Model id without the provider prefix
    pub fn model_id(&self) -> String {
        match &self.variant {
            Some(variant) => format!("{}/{}", self.model, variant),
            None => self.model.clone(),
        }
    }
}

fn invalid(model_string: &str) -> RelayError {
    RelayError::Config(format!(
        "Invalid model format '{}'. Expected 'provider/model' or 'provider/model/variant'",
        model_string
    ))
}

impl fmt::Display for ModelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model_id())
    }
}

/// How eligible credentials are ranked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fewest requests in the current minute window first
    #[default]
    LeastUsed,

    /// Rotate the starting credential on every selection
    RoundRobin,

    /// Cheapest expected cost first, ties broken by least-used
    WeightedCost,

    /// The caller's last credential first, then least-used
    #[serde(alias = "sticky_user")]
    Sticky,
}

impl Strategy {
    /// Baseline confidence of a decision made with this strategy
    pub(crate) fn base_confidence(self) -> f64 {
        match self {
            Strategy::LeastUsed => 0.9,
            Strategy::RoundRobin => 0.8,
            Strategy::WeightedCost => 0.85,
            Strategy::Sticky => 0.9,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::LeastUsed => "least_used",
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedCost => "weighted_cost",
            Strategy::Sticky => "sticky",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let route = ModelRoute::parse("openai/gpt-4").unwrap();
        assert_eq!(route.provider, "openai");
        assert_eq!(route.model, "gpt-4");
        assert_eq!(route.variant, None);
    }

    #[test]
    fn test_parse_with_variant() {
        let route = ModelRoute::parse("azure/gpt-4/my-deployment").unwrap();
        assert_eq!(route.model_id(), "gpt-4/my-deployment");
        assert_eq!(route.to_string(), "azure/gpt-4/my-deployment");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(ModelRoute::parse("just-a-model").is_err());
        assert!(ModelRoute::parse("a/b/c/d").is_err());
        assert!(ModelRoute::parse("openai/").is_err());
    }

    #[test]
    fn test_strategy_names() {
        let parsed: Strategy = serde_json::from_str(r#""sticky_user""#).unwrap();
        assert_eq!(parsed, Strategy::Sticky);
        assert_eq!(
            serde_json::to_string(&Strategy::WeightedCost).unwrap(),
            r#""weighted_cost""#
        );
        assert_eq!(Strategy::default(), Strategy::LeastUsed);
    }
}
