//! Message conversion for OpenAI-style chat completion APIs
//!
//! Converts the Anthropic-shaped internal message format into the flat
//! role/content/tool_calls layout the chat completions endpoint expects.

use std::collections::HashSet;

use serde::Serialize;

use super::{ContentBlock, Message, Role};

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiCompatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiCompatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiCompatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAiCompatFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiCompatFunction {
    pub name: String,
    pub arguments: String,
}

impl OpenAiCompatMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Convert internal messages (plus an optional system prompt) to chat messages.
///
/// Tool results become separate `tool` messages placed before any text of the
/// same turn; all tool calls of an assistant turn share one message.
pub fn convert_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<OpenAiCompatMessage> {
    let mut result = Vec::new();

    if let Some(system) = system_prompt {
        result.push(OpenAiCompatMessage::text("system", system.to_string()));
    }

    for msg in messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        let mut tool_calls = Vec::new();
        let mut text_content = String::new();
        let mut tool_results = Vec::new();

        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => {
                    if !text_content.is_empty() {
                        text_content.push('\n');
                    }
                    text_content.push_str(text);
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(OpenAiCompatToolCall {
                        id: id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAiCompatFunction {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => {
                    tool_results.push((tool_use_id.clone(), content.clone()));
                }
            }
        }

        if !tool_calls.is_empty() {
            result.push(OpenAiCompatMessage {
                role: "assistant".to_string(),
                content: if text_content.is_empty() {
                    None
                } else {
                    Some(text_content)
                },
                tool_calls: Some(tool_calls),
                tool_call_id: None,
            });
            continue;
        }

        for (tool_use_id, content) in tool_results {
            result.push(OpenAiCompatMessage {
                role: "tool".to_string(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(tool_use_id),
            });
        }

        if !text_content.is_empty() {
            result.push(OpenAiCompatMessage::text(role, text_content));
        }
    }

    validate_tool_pairs(result)
}

/// Drop tool calls that have no matching tool response.
///
/// The API rejects an assistant `tool_calls` message that is not followed by a
/// `tool` message for every call id.
pub fn validate_tool_pairs(messages: Vec<OpenAiCompatMessage>) -> Vec<OpenAiCompatMessage> {
    let found_tool_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == "tool")
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    let orphaned = messages
        .iter()
        .filter_map(|m| m.tool_calls.as_ref())
        .flatten()
        .filter(|tc| !found_tool_ids.contains(&tc.id))
        .count();

    if orphaned == 0 {
        return messages;
    }

    tracing::warn!("Removing {} tool calls without responses", orphaned);

    let mut result = Vec::new();
    for msg in messages {
        if let Some(ref tool_calls) = msg.tool_calls {
            if !tool_calls.iter().all(|tc| found_tool_ids.contains(&tc.id)) {
                if let Some(content) = msg.content {
                    result.push(OpenAiCompatMessage::text(&msg.role, content));
                }
                continue;
            }
        }
        result.push(msg);
    }
    result
}
