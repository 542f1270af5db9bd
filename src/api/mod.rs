//! API Module
//!
//! Request descriptor, normalization/fingerprinting and dispatch result types.

pub mod request;
pub mod response;

pub use request::{
    ContentPart, Fingerprint, ImageUrl, InboundRequest, Message, MessageContent,
    NormalizedRequest, Prompt, SamplingParams,
};
pub use response::{Completion, DispatchOutcome, ResponseSource};
