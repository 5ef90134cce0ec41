//! Reasoning-service backends used for score refinement
//!
//! Supports OpenAI-compatible APIs (OpenAI, OpenRouter, local servers)
//! and Anthropic Claude.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Reasoning backend errors
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Empty response")]
    EmptyResponse,
}

/// One completion request
#[derive(Debug, Clone)]
pub struct ReasoningRequest<'a> {
    pub system: &'a str,
    pub prompt: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Generic reasoning backend
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Run one completion and return the raw reply text
    async fn complete(&self, request: &ReasoningRequest<'_>) -> Result<String, ReasoningError>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible backend configuration
#[derive(Debug, Clone)]
pub struct OpenAIBackendConfig {
    pub api_key: String,
    /// Base URL (for OpenRouter, local servers, etc.)
    pub base_url: Option<String>,
    pub model: String,
}

impl OpenAIBackendConfig {
    pub fn openai(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: None,
            model: model.to_string(),
        }
    }

    pub fn openrouter(api_key: &str, model: &str) -> Self {
        Self {
            base_url: Some("https://openrouter.ai/api/v1".to_string()),
            ..Self::openai(api_key, model)
        }
    }

    pub fn local(base_url: &str, model: &str) -> Self {
        Self {
            base_url: Some(base_url.to_string()),
            ..Self::openai("sk-local", model)
        }
    }
}

fn api_error<E: std::fmt::Display>(e: E) -> ReasoningError {
    ReasoningError::Api(e.to_string())
}

/// OpenAI-compatible backend
pub struct OpenAIBackend {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAIBackend {
    pub fn new(config: OpenAIBackendConfig) -> Result<Self, ReasoningError> {
        if config.api_key.is_empty() {
            return Err(ReasoningError::Config("missing API key".to_string()));
        }

        let mut openai_config = OpenAIConfig::new().with_api_key(&config.api_key);
        if let Some(base_url) = &config.base_url {
            openai_config = openai_config.with_api_base(base_url);
        }

        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model,
        })
    }
}

#[async_trait]
impl ReasoningBackend for OpenAIBackend {
    async fn complete(&self, request: &ReasoningRequest<'_>) -> Result<String, ReasoningError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system)
                    .build()
                    .map_err(api_error)?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(request.prompt)
                    .build()
                    .map_err(api_error)?,
            ),
        ];

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .build()
            .map_err(api_error)?;

        let response = self.client.chat().create(chat_request).await.map_err(api_error)?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or(ReasoningError::EmptyResponse)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Anthropic Claude backend configuration
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl AnthropicConfig {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

/// Anthropic Claude backend
pub struct AnthropicBackend {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig) -> Result<Self, ReasoningError> {
        if config.api_key.is_empty() {
            return Err(ReasoningError::Config("missing API key".to_string()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }
}

#[async_trait]
impl ReasoningBackend for AnthropicBackend {
    async fn complete(&self, request: &ReasoningRequest<'_>) -> Result<String, ReasoningError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [
                {"role": "user", "content": request.prompt}
            ]
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| ReasoningError::Api(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Api(format!("Anthropic API error {}: {}", status, text)));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ReasoningError::Api(e.to_string()))?;

        json["content"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|block| block["text"].as_str())
            .map(|s| s.to_string())
            .ok_or(ReasoningError::EmptyResponse)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Thread-safe reference to a reasoning backend
pub type SharedBackend = Arc<dyn ReasoningBackend>;

/// Create a shared OpenAI-compatible backend
pub fn create_backend(config: OpenAIBackendConfig) -> Result<SharedBackend, ReasoningError> {
    Ok(Arc::new(OpenAIBackend::new(config)?))
}

/// Create a shared Anthropic backend
pub fn create_anthropic_backend(config: AnthropicConfig) -> Result<SharedBackend, ReasoningError> {
    Ok(Arc::new(AnthropicBackend::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openrouter_config() {
        let config = OpenAIBackendConfig::openrouter("key", "openai/gpt-4o-mini");
        assert_eq!(config.base_url.as_deref(), Some("https://openrouter.ai/api/v1"));
        assert_eq!(config.api_key, "key");
    }

    #[test]
    fn test_missing_key_rejected() {
        assert!(matches!(
            AnthropicBackend::new(AnthropicConfig::new("", "claude")),
            Err(ReasoningError::Config(_))
        ));
        assert!(create_backend(OpenAIBackendConfig::openai("", "gpt-4o-mini")).is_err());
    }

    #[tokio::test]
    async fn test_anthropic_unreachable_is_api_error() {
        let mut config = AnthropicConfig::new("key", "claude");
        config.base_url = "http://127.0.0.1:1".to_string();
        let backend = AnthropicBackend::new(config).unwrap();

        let request = ReasoningRequest {
            system: "s",
            prompt: "p",
            max_tokens: 10,
            temperature: 0.2,
        };
        assert!(matches!(backend.complete(&request).await, Err(ReasoningError::Api(_))));
    }
}
