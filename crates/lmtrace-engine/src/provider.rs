//! The injected model-provider collaborator.
//!
//! Providers are selected dynamically by client type and perform the
//! actual model call. Provider errors are fatal to the wrapped call and
//! propagate normally -- unlike tracking errors, they are never swallowed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use lmtrace_core::model::Usage;

/// One message in a prompt conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// The exact call an LMP body asks the provider to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Provider-specific API parameters, passed through verbatim.
    pub api_params: serde_json::Value,
}

/// Normalized provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub results: serde_json::Value,
    pub usage: Option<Usage>,
}

/// Errors from the model call itself.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider response malformed: {0}")]
    Malformed(String),
}

/// Performs a model call for a prompt produced by an LMP body.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn call(&self, request: &PromptRequest) -> Result<ProviderResponse, ProviderError>;
}
