use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, LlmProvider};

pub mod anthropic;
pub mod openai;
pub mod openai_compat;
pub mod retry;
pub mod structured;

pub use retry::RetryingClient;
pub use structured::{extract_json, generate_object, Generated};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// How the model may pick among the offered tools
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// Model decides whether to call a tool
    #[default]
    Auto,
    /// Model must call the named tool (used for structured output)
    Tool(String),
}

/// Token usage information from LLM response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Add another usage sample to this one
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// Response from LLM including message and token usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub message: Message,
    pub usage: Option<TokenUsage>,
}

impl LlmResponse {
    /// Concatenated text blocks of the response
    pub fn text(&self) -> String {
        self.message.text()
    }

    /// Input of the first call to the named tool, if the model made one
    pub fn tool_input(&self, tool_name: &str) -> Option<&serde_json::Value> {
        self.message.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse { name, input, .. } if name == tool_name => Some(input),
            _ => None,
        })
    }
}

/// Typed failures raised by generation backends.
///
/// Backends return `anyhow::Error`; callers that care about the failure class
/// (the retrying client, structured generation) downcast to this type.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Response did not match the expected schema: {0}")]
    SchemaValidation(String),
}

impl LlmError {
    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Api { status, .. } => matches!(status, 500 | 502 | 503 | 504 | 529),
            LlmError::SchemaValidation(_) => false,
        }
    }
}

/// Map a non-success HTTP response onto an `LlmError`
pub(crate) async fn error_from_response(response: reqwest::Response) -> LlmError {
    let status = response.status().as_u16();
    if status == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return LlmError::RateLimited { retry_after };
    }
    let body = response.text().await.unwrap_or_default();
    LlmError::Api { status, body }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model identifier used for token accounting
    fn model(&self) -> &str;

    /// Send messages with an optional system prompt and an explicit tool choice
    async fn send_message_with_tool_choice(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: Option<&str>,
        tool_choice: ToolChoice,
    ) -> Result<LlmResponse>;

    /// Send a message to the LLM with optional system prompt
    async fn send_message_with_system(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: Option<&str>,
    ) -> Result<LlmResponse> {
        self.send_message_with_tool_choice(messages, tools, system_prompt, ToolChoice::Auto)
            .await
    }

    /// Send a message to the LLM (no system prompt)
    async fn send_message(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse> {
        self.send_message_with_system(messages, tools, None).await
    }
}

/// Create the configured provider client, wrapped with rate-limit retries
pub fn create_client(config: &Config) -> Result<Arc<dyn LlmClient>> {
    let inner = create_provider_client(config)?;
    Ok(Arc::new(RetryingClient::new(inner, config.retry.clone())))
}

fn create_provider_client(config: &Config) -> Result<Box<dyn LlmClient>> {
    match config.llm.provider {
        LlmProvider::Anthropic => {
            let api_key = config
                .llm
                .api_key
                .clone()
                .context("Anthropic API key not set. Set ANTHROPIC_API_KEY or run 'stepwise config --api-key'")?;
            tracing::info!("Using Anthropic model {}", config.llm.model);
            Ok(Box::new(anthropic::AnthropicClient::new(
                api_key,
                config.llm.model.clone(),
                config.llm.max_tokens,
                config.llm.base_url.clone(),
            )))
        }
        LlmProvider::OpenAI => {
            let api_key = config
                .llm
                .api_key
                .clone()
                .context("OpenAI API key not set. Set OPENAI_API_KEY or run 'stepwise config --api-key'")?;
            tracing::info!("Using OpenAI model {}", config.llm.model);
            Ok(Box::new(openai::OpenAiClient::new(
                api_key,
                config.llm.model.clone(),
                config.llm.max_tokens,
                config.llm.base_url.clone(),
            )))
        }
    }
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentBlock::Text { text: text.into() }])
    }

    /// Concatenated text blocks of this message
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}
