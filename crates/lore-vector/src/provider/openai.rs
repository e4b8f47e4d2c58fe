//! OpenAI-compatible HTTP provider.
//!
//! Talks to `/embeddings` and `/chat/completions` on any endpoint that speaks
//! the OpenAI wire format. Only classifies failures; it never retries.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use lore_core::config::ProviderConfig;
use lore_core::error::{LoreError, Result, TransientKind};

use super::{CompletionRequest, ModelProvider};

/// Longest slice of an error body kept in the error message.
const ERROR_BODY_PREVIEW: usize = 300;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
    dimension: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig, dimension: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|e| LoreError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
            dimension,
            temperature: config.temperature,
        })
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            LoreError::ProviderPermanent(
                "no API key configured (set provider.api_key, LORE_API_KEY or OPENAI_API_KEY)"
                    .into(),
            )
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key()?)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
            "dimensions": self.dimension,
        });
        let resp = self.post("/embeddings", body).await?;
        let parsed: EmbeddingResponse = resp.json().await.map_err(|e| {
            LoreError::transient(
                TransientKind::Server,
                format!("malformed embedding response: {}", e),
            )
        })?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                LoreError::transient(TransientKind::Server, "embedding response had no data")
            })?;
        debug!(model = %self.embedding_model, dims = vector.len(), "Embedding received");
        Ok(vector)
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.chat_model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.temperature),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let resp = self.post("/chat/completions", body).await?;
        let parsed: ChatResponse = resp.json().await.map_err(|e| {
            LoreError::transient(
                TransientKind::Server,
                format!("malformed completion response: {}", e),
            )
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                LoreError::transient(TransientKind::Server, "completion response had no content")
            })
    }
}

fn classify_send_error(e: reqwest::Error) -> LoreError {
    if e.is_timeout() {
        LoreError::transient(TransientKind::Timeout, e.to_string())
    } else if e.is_builder() {
        LoreError::ProviderPermanent(format!("invalid request: {}", e))
    } else {
        LoreError::transient(TransientKind::Network, e.to_string())
    }
}

/// Map a non-success HTTP status to the provider error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> LoreError {
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), preview);
    match status {
        StatusCode::TOO_MANY_REQUESTS => LoreError::transient(TransientKind::RateLimited, message),
        StatusCode::REQUEST_TIMEOUT => LoreError::transient(TransientKind::Timeout, message),
        s if s.is_server_error() => LoreError::transient(TransientKind::Server, message),
        _ => LoreError::ProviderPermanent(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            LoreError::ProviderTransient {
                kind: TransientKind::RateLimited,
                ..
            }
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            LoreError::ProviderPermanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "too long"),
            LoreError::ProviderPermanent(_)
        ));
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(1000);
        match classify_status(StatusCode::BAD_REQUEST, &body) {
            LoreError::ProviderPermanent(msg) => assert!(msg.len() < 400),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_is_permanent() {
        let config = ProviderConfig {
            api_key: Some(String::new()),
            base_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        };
        let mut provider = OpenAiProvider::new(&config, 8).unwrap();
        provider.api_key = None;
        let err = provider.embed("hello").await.unwrap_err();
        assert!(matches!(err, LoreError::ProviderPermanent(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let config = ProviderConfig {
            api_key: Some("k".into()),
            base_url: "http://127.0.0.1:9".into(),
            request_timeout_ms: 500,
            ..Default::default()
        };
        let provider = OpenAiProvider::new(&config, 8).unwrap();
        let err = provider.embed("hello").await.unwrap_err();
        assert!(err.is_transient(), "got {:?}", err);
    }
}
