use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::openai_compat::{convert_messages, OpenAiCompatMessage};
use super::{
    error_from_response, ContentBlock, LlmClient, LlmResponse, Message, TokenUsage, ToolChoice,
    ToolDefinition,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiClient {
    api_key: String,
    model: String,
    max_tokens: usize,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: usize,
    messages: Vec<OpenAiCompatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunctionDef,
}

#[derive(Debug, Serialize)]
struct ChatFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    id: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

impl OpenAiClient {
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

    fn convert_response(message: ChatMessage) -> Result<Message> {
        let mut content = Vec::new();
        if let Some(text) = message.content.filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Text { text });
        }
        for call in message.tool_calls {
            let input = serde_json::from_str(&call.function.arguments).with_context(|| {
                format!("Tool call '{}' carried invalid JSON arguments", call.function.name)
            })?;
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
        Ok(Message::assistant(content))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
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
        let tool_choice = match (&tool_choice, tools.is_empty()) {
            (ToolChoice::Tool(name), false) => Some(serde_json::json!({
                "type": "function",
                "function": {"name": name}
            })),
            _ => None,
        };

        let request = ChatRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: convert_messages(system_prompt, messages),
            tools: tools
                .iter()
                .map(|t| ChatTool {
                    tool_type: "function",
                    function: ChatFunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect(),
            tool_choice,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenAI")?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await.into());
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .context("OpenAI response contained no choices")?;

        Ok(LlmResponse {
            message: Self::convert_response(choice.message)?,
            usage: chat_response
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}
