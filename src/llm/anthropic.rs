use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    error_from_response, ContentBlock, LlmClient, LlmResponse, Message, Role, TokenUsage,
    ToolChoice, ToolDefinition,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicClient {
    api_key: String,
    model: String,
    max_tokens: usize,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContent {
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
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: usize,
    output_tokens: usize,
}

impl AnthropicClient {
    pub fn new(
        api_key: String,
        model: String,
        max_tokens: usize,
        base_url: Option<String>,
    ) -> Self {
        Self {
            api_key,
            model,
            max_tokens,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn convert_message_to_anthropic(msg: &Message) -> AnthropicMessage {
        AnthropicMessage {
            role: match msg.role {
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
            },
            content: msg
                .content
                .iter()
                .map(|c| match c {
                    ContentBlock::Text { text } => AnthropicContent::Text { text: text.clone() },
                    ContentBlock::ToolUse { id, name, input } => AnthropicContent::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => AnthropicContent::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                    },
                })
                .collect(),
        }
    }

    fn convert_anthropic_to_message(content: Vec<AnthropicContent>) -> Message {
        Message {
            role: Role::Assistant,
            content: content
                .into_iter()
                .filter_map(|c| match c {
                    AnthropicContent::Text { text } => Some(ContentBlock::Text { text }),
                    AnthropicContent::ToolUse { id, name, input } => {
                        Some(ContentBlock::ToolUse { id, name, input })
                    }
                    AnthropicContent::ToolResult {
                        tool_use_id,
                        content,
                    } => Some(ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    }),
                    AnthropicContent::Unsupported => None,
                })
                .collect(),
        }
    }

    fn tool_choice_value(choice: &ToolChoice, has_tools: bool) -> Option<serde_json::Value> {
        if !has_tools {
            return None;
        }
        match choice {
            ToolChoice::Auto => None,
            ToolChoice::Tool(name) => Some(serde_json::json!({"type": "tool", "name": name})),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send_message_with_tool_choice(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: Option<&str>,
        tool_choice: ToolChoice,
    ) -> Result<LlmResponse> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: system_prompt.map(str::to_string),
            messages: messages
                .iter()
                .map(Self::convert_message_to_anthropic)
                .collect(),
            tools: tools
                .iter()
                .map(|t| AnthropicTool {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect(),
            tool_choice: Self::tool_choice_value(&tool_choice, !tools.is_empty()),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic")?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await.into());
        }

        let anthropic_response: AnthropicResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        let usage = anthropic_response
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens));

        Ok(LlmResponse {
            message: Self::convert_anthropic_to_message(anthropic_response.content),
            usage,
        })
    }
}
