//! Schema-constrained generation
//!
//! The JSON schema of the target type is offered as the only tool and the model
//! is forced to call it. Providers that ignore tool choice can still answer with
//! a JSON object in plain text, which is accepted as well.

use anyhow::Result;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use super::{LlmClient, LlmError, Message, TokenUsage, ToolChoice, ToolDefinition};

/// A typed object produced by the model, with the usage it cost
#[derive(Debug, Clone)]
pub struct Generated<T> {
    pub value: T,
    pub usage: TokenUsage,
    pub model: String,
}

/// JSON schema for `T` with every subschema inlined
pub fn schema_for<T: JsonSchema>() -> serde_json::Value {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Generate an instance of `T` via a forced tool call.
///
/// Tries up to `max_attempts` times (at least once); when no attempt yields a
/// value that deserializes into `T`, fails with `LlmError::SchemaValidation`.
/// Transport errors are returned immediately.
pub async fn generate_object<T>(
    client: &dyn LlmClient,
    system_prompt: &str,
    messages: &[Message],
    tool_name: &str,
    tool_description: &str,
    max_attempts: usize,
) -> Result<Generated<T>>
where
    T: DeserializeOwned + JsonSchema,
{
    let tool = ToolDefinition {
        name: tool_name.to_string(),
        description: tool_description.to_string(),
        input_schema: schema_for::<T>(),
    };

    let mut usage = TokenUsage::default();
    let mut last_error = String::from("no attempt was made");

    for attempt in 1..=max_attempts.max(1) {
        let response = client
            .send_message_with_tool_choice(
                messages,
                std::slice::from_ref(&tool),
                Some(system_prompt),
                ToolChoice::Tool(tool_name.to_string()),
            )
            .await?;

        if let Some(u) = &response.usage {
            usage.accumulate(u);
        }

        let candidate = match response.tool_input(tool_name) {
            Some(input) => serde_json::from_value::<T>(input.clone()),
            None => serde_json::from_str::<T>(&extract_json(&response.text())),
        };

        match candidate {
            Ok(value) => {
                return Ok(Generated {
                    value,
                    usage,
                    model: client.model().to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Structured output for '{}' did not match schema (attempt {}): {}",
                    tool_name,
                    attempt,
                    e
                );
                last_error = e.to_string();
            }
        }
    }

    Err(LlmError::SchemaValidation(last_error).into())
}

/// Extract a JSON object from free text (handles markdown code fences)
pub fn extract_json(response: &str) -> String {
    let trimmed = response.trim();

    if trimmed.starts_with("```") {
        let start = trimmed.find('\n').map(|pos| pos + 1).unwrap_or(3);
        if let Some(end) = trimmed.rfind("```") {
            if end > start {
                return trimmed[start..end].trim().to_string();
            }
        }
    }

    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return trimmed[start..=end].to_string();
            }
        }
    }

    trimmed.to_string()
}
