//! Model provider abstraction.
//!
//! A provider turns text into embedding vectors and answers completion
//! prompts. Implementations classify every failure into the transient or
//! permanent provider variants of [`LoreError`](lore_core::LoreError); retry,
//! deadlines and circuit breaking live one layer up in
//! [`ProviderClient`](crate::client::ProviderClient).

mod mock;
mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lore_core::config::ProviderConfig;
use lore_core::error::{LoreError, Result};

pub use mock::{MockProvider, ScriptedFailure};
pub use openai::OpenAiProvider;

/// A completion prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Instructions sent as the system message.
    pub system: Option<String>,
    /// The user message.
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON response.
    pub json: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// An external embedding and completion backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Short provider name for logs and health output.
    fn name(&self) -> &str;

    /// Identifier of the embedding model. Part of every cache fingerprint.
    fn embedding_model(&self) -> &str;

    /// Embed already normalized, already truncated text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Run a completion and return the raw text of the first choice.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Build the provider named by `config.kind`.
pub fn from_config(config: &ProviderConfig, dimension: usize) -> Result<Arc<dyn ModelProvider>> {
    match config.kind.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config, dimension)?)),
        "mock" => Ok(Arc::new(MockProvider::new(dimension))),
        other => Err(LoreError::Config(format!(
            "unknown provider kind '{}', expected 'openai' or 'mock'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_mock() {
        let config = ProviderConfig {
            kind: "mock".into(),
            ..Default::default()
        };
        let provider = from_config(&config, 8).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn test_from_config_unknown_kind() {
        let config = ProviderConfig {
            kind: "carrier-pigeon".into(),
            ..Default::default()
        };
        let err = from_config(&config, 8).err().unwrap();
        assert!(matches!(err, LoreError::Config(_)));
    }

    #[test]
    fn test_completion_request_builder() {
        let req = CompletionRequest::new("hi")
            .with_system("be brief")
            .with_temperature(0.2)
            .json();
        assert_eq!(req.system.as_deref(), Some("be brief"));
        assert!(req.json);
        assert_eq!(req.max_tokens, None);
    }
}
