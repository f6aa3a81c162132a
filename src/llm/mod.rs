//! LLM and search provider clients.
//!
//! Both speak the OpenAI-compatible chat completions wire shape. Strategies
//! and executors depend only on the `LlmClient`/`SearchClient` traits so
//! tests can script responses.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, SearchConfig};
use crate::error::LlmError;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response.
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            max_tokens: None,
            temperature: None,
            json_response: false,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub total_tokens: i64,
}

/// An online search response with citations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub content: String,
    #[serde(default)]
    pub citations: Vec<String>,
}

/// Chat completion provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

/// Online search provider.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(
        &self,
        query: &str,
        system_prompt: Option<&str>,
        recency: Option<&str>,
    ) -> Result<SearchOutcome, LlmError>;
}

// --- Wire types (OpenAI-compatible) ---

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<HashMap<&'a str, &'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_recency_filter: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    citations: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    total_tokens: i64,
}

async fn post_chat(
    client: &Client,
    provider: &str,
    base_url: &str,
    api_key: &str,
    body: &WireRequest<'_>,
) -> Result<WireResponse, LlmError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    tracing::debug!("Sending request to {}: {}", provider, url);

    let response = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    if !status.is_success() {
        if status.as_u16() == 401 {
            return Err(LlmError::AuthFailed {
                provider: provider.to_string(),
            });
        }
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                provider: provider.to_string(),
            });
        }
        return Err(LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {text}"),
        });
    }

    serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("JSON parse error: {e}"),
    })
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiChatClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAiChatClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if config.api_key.is_none() {
            return Err(LlmError::NotConfigured {
                provider: "openai".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let response_format = request
            .json_response
            .then(|| HashMap::from([("type", "json_object")]));
        let body = WireRequest {
            model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format,
            search_recency_filter: None,
        };
        let api_key = self.config.api_key.clone().unwrap_or_default();
        let base = format!("{}/v1", self.config.base_url.trim_end_matches('/'));
        let wire = post_chat(&self.client, "openai", &base, &api_key, &body).await?;

        let content = wire
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: "openai".to_string(),
                reason: "no choices in response".to_string(),
            })?;
        Ok(Completion {
            content,
            total_tokens: wire.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

/// Perplexity-style online search client.
pub struct PerplexitySearchClient {
    client: Client,
    config: SearchConfig,
}

impl PerplexitySearchClient {
    pub fn new(config: SearchConfig) -> Result<Self, LlmError> {
        if config.api_key.is_none() {
            return Err(LlmError::NotConfigured {
                provider: "perplexity".to_string(),
            });
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SearchClient for PerplexitySearchClient {
    async fn search(
        &self,
        query: &str,
        system_prompt: Option<&str>,
        recency: Option<&str>,
    ) -> Result<SearchOutcome, LlmError> {
        let messages = vec![
            ChatMessage::system(system_prompt.unwrap_or("Provide current, sourced information.")),
            ChatMessage::user(query),
        ];
        let body = WireRequest {
            model: &self.config.model,
            messages: &messages,
            max_tokens: None,
            temperature: Some(0.2),
            response_format: None,
            search_recency_filter: recency,
        };
        let api_key = self.config.api_key.clone().unwrap_or_default();
        let wire = post_chat(
            &self.client,
            "perplexity",
            &self.config.base_url,
            &api_key,
            &body,
        )
        .await?;

        let content = wire
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(SearchOutcome {
            content,
            citations: wire.citations.unwrap_or_default(),
        })
    }
}

/// Strip a markdown code fence from ostensibly-JSON model output.
///
/// Providers occasionally wrap JSON responses in ```json fences even when a
/// JSON response format was requested.
pub fn strip_json_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
