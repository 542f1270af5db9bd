//! Client Module
//!
//! Upstream connectors and retry-hint parsing.

pub mod connector;
pub mod http;
pub mod retry_hint;

pub use connector::{ConnectorRouter, UpstreamConnector, UpstreamReply};
pub use http::{HttpConnector, ProviderEndpoint};
