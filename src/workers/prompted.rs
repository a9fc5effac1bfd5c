//! Prompt-only workers (verification and intent analysis)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::llm::LlmClient;
use crate::orchestrator::{Worker, WorkerOutput, WorkerRequest};

use super::worker_messages;

const VERIFICATION_PROMPT: &str = r#"You are the verification worker of stepwise, an AI coding assistant.
Check the results you are given for correctness, completeness and consistency with the user's request.
Point out concrete problems and what would fix them. When asked for a summary, answer tersely: at most 4 lines unless the user asked for detail.
The execution context message describes the plan step you are working on."#;

const USER_INTENT_PROMPT: &str = r#"You are the intent-analysis worker of stepwise, an AI coding assistant.
Work out what the user actually wants: the goal, the scope, explicit constraints and reasonable assumptions for anything left open.
Answer with a short, precise restatement of the request followed by the assumptions you made.
The execution context message describes the plan step you are working on."#;

/// A worker that answers with a single model call under a fixed system prompt
pub struct PromptedWorker {
    name: String,
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl PromptedWorker {
    pub fn new(name: impl Into<String>, llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn verification(llm: Arc<dyn LlmClient>) -> Self {
        Self::new("verification", llm, VERIFICATION_PROMPT)
    }

    pub fn user_intent(llm: Arc<dyn LlmClient>) -> Self {
        Self::new("userIntent", llm, USER_INTENT_PROMPT)
    }
}

#[async_trait]
impl Worker for PromptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let messages = worker_messages(&request)?;
        let response = self
            .llm
            .send_message_with_system(&messages, &[], Some(&self.system_prompt))
            .await?;

        let text = response.text();
        if text.trim().is_empty() {
            bail!("{} worker returned an empty answer", self.name);
        }

        Ok(WorkerOutput::text(text.trim())
            .with_usage(response.usage.unwrap_or_default(), self.llm.model()))
    }
}
