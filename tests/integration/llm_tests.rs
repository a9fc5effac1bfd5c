use anyhow::Result;
use serde::Deserialize;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stepwise::config::{Config, LlmProvider, RetryConfig};
use stepwise::llm::anthropic::AnthropicClient;
use stepwise::llm::openai::OpenAiClient;
use stepwise::llm::{
    create_client, generate_object, LlmClient, LlmError, Message, RetryingClient, ToolChoice,
    ToolDefinition,
};

fn anthropic(server: &MockServer) -> AnthropicClient {
    AnthropicClient::new(
        "test-key".to_string(),
        "claude-test".to_string(),
        1024,
        Some(server.uri()),
    )
}

fn fast_retries(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_factor: 0.0,
    }
}

fn anthropic_tool_response(name: &str, input: serde_json::Value) -> serde_json::Value {
    json!({
        "id": "msg_123",
        "type": "message",
        "role": "assistant",
        "content": [
            {"type": "text", "text": "Planning."},
            {"type": "tool_use", "id": "toolu_1", "name": name, "input": input}
        ],
        "model": "claude-test",
        "stop_reason": "tool_use",
        "usage": {"input_tokens": 42, "output_tokens": 7}
    })
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct Answer {
    value: u32,
}

#[tokio::test]
async fn test_anthropic_forced_tool_call() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-test",
            "system": "be brief",
            "tool_choice": {"type": "tool", "name": "submit_plan"}
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(anthropic_tool_response("submit_plan", json!({"steps": []}))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let tool = ToolDefinition {
        name: "submit_plan".to_string(),
        description: "Submit the plan".to_string(),
        input_schema: json!({"type": "object"}),
    };
    let response = anthropic(&server)
        .send_message_with_tool_choice(
            &[Message::user("plan this")],
            &[tool],
            Some("be brief"),
            ToolChoice::Tool("submit_plan".to_string()),
        )
        .await?;

    assert_eq!(response.text(), "Planning.");
    assert_eq!(response.tool_input("submit_plan"), Some(&json!({"steps": []})));
    let usage = response.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (42, 7));
    Ok(())
}

#[tokio::test]
async fn test_anthropic_api_error_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let err = anthropic(&server)
        .send_message(&[Message::user("hi")], &[])
        .await
        .unwrap_err();

    match err.downcast_ref::<LlmError>() {
        Some(LlmError::Api { status, body }) => {
            assert_eq!(*status, 400);
            assert_eq!(body, "bad request");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_rate_limit_is_retried() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = RetryingClient::new(Box::new(anthropic(&server)), fast_retries(2));
    let response = client.send_message(&[Message::user("hi")], &[]).await?;

    assert_eq!(response.text(), "ok");
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let client = RetryingClient::new(Box::new(anthropic(&server)), fast_retries(2));
    let err = client
        .send_message(&[Message::user("hi")], &[])
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<LlmError>(),
        Some(LlmError::RateLimited { .. })
    ));
}

#[tokio::test]
async fn test_openai_structured_output() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "tool_choice": {"type": "function", "function": {"name": "answer"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "answer", "arguments": "{\"value\": 7}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 3}
        })))
        .mount(&server)
        .await;

    let client = OpenAiClient::new(
        "sk-test".to_string(),
        "gpt-test".to_string(),
        512,
        Some(server.uri()),
    );
    let generated = generate_object::<Answer>(
        &client,
        "answer with a number",
        &[Message::user("how many?")],
        "answer",
        "Give the answer",
        1,
    )
    .await?;

    assert_eq!(generated.value.value, 7);
    assert_eq!(generated.usage.total(), 14);
    assert_eq!(generated.model, "gpt-test");
    Ok(())
}

#[tokio::test]
async fn test_create_client_uses_configured_endpoint() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "configured-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "hello"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.llm.provider = LlmProvider::Anthropic;
    config.llm.api_key = Some("configured-key".to_string());
    config.llm.model = "claude-test".to_string();
    config.llm.base_url = Some(server.uri());

    let client = create_client(&config)?;
    assert_eq!(client.model(), "claude-test");
    let response = client.send_message(&[Message::user("hi")], &[]).await?;
    assert_eq!(response.text(), "hello");
    Ok(())
}

#[test]
fn test_create_client_requires_api_key() {
    let mut config = Config::default();
    config.llm.api_key = None;
    assert!(create_client(&config).is_err());
}
