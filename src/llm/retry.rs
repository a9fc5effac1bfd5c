//! Retrying LLM client
//!
//! Wraps a provider client and retries rate-limit and transient server errors
//! with exponential backoff plus jitter. Everything else is returned to the
//! caller untouched; schema mismatches are never retried here.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

use super::{LlmClient, LlmError, LlmResponse, Message, ToolChoice, ToolDefinition};

pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
        let exponential = config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(config.max_delay_ms);

        let jitter_range = (capped as f64 * config.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped + jitter)
    }

    fn retry_delay(&self, error: &anyhow::Error, attempt: u32) -> Option<Duration> {
        let llm_error = error.downcast_ref::<LlmError>()?;
        if !llm_error.is_transient() {
            return None;
        }
        let backoff = Self::backoff_delay(&self.config, attempt);
        match llm_error {
            LlmError::RateLimited {
                retry_after: Some(after),
            } => Some((*after).min(Duration::from_millis(self.config.max_delay_ms)).max(backoff)),
            _ => Some(backoff),
        }
    }
}

#[async_trait]
impl LlmClient for RetryingClient {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn send_message_with_tool_choice(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        system_prompt: Option<&str>,
        tool_choice: ToolChoice,
    ) -> Result<LlmResponse> {
        let mut attempt = 0;
        loop {
            let result = self
                .inner
                .send_message_with_tool_choice(messages, tools, system_prompt, tool_choice.clone())
                .await;

            let error = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries {
                return Err(error);
            }

            match self.retry_delay(&error, attempt) {
                Some(delay) => {
                    tracing::warn!(
                        "LLM call failed ({}), retrying in {}ms (attempt {}/{})",
                        error,
                        delay.as_millis(),
                        attempt + 1,
                        self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(error),
            }
        }
    }
}
