use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};

use stepwise::config::OrchestratorConfig;
use stepwise::llm::{
    ContentBlock, LlmClient, LlmResponse, Message, TokenUsage, ToolChoice, ToolDefinition,
};
use stepwise::orchestrator::{
    CapabilityRegistry, OrchestratorAgent, Worker, WorkerOutput, WorkerRequest, WorkerRole,
};
use stepwise::project::AmbientContext;

/// Model that answers every forced tool call with the same object and every
/// plain call with a fixed text
pub struct ScriptedLlm {
    pub tool_input: Value,
    pub text: String,
    pub calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlm {
    pub fn new(tool_input: Value) -> Self {
        Self {
            tool_input,
            text: "scripted answer".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn send_message_with_tool_choice(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
        _system_prompt: Option<&str>,
        tool_choice: ToolChoice,
    ) -> Result<LlmResponse> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let content = match tool_choice {
            ToolChoice::Tool(name) => vec![ContentBlock::ToolUse {
                id: "toolu_test".to_string(),
                name,
                input: self.tool_input.clone(),
            }],
            ToolChoice::Auto => vec![ContentBlock::Text {
                text: self.text.clone(),
            }],
        };
        Ok(LlmResponse {
            message: Message::assistant(content),
            usage: Some(TokenUsage::new(100, 25)),
        })
    }
}

/// Model whose every call fails
pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    fn model(&self) -> &str {
        "failing-model"
    }

    async fn send_message_with_tool_choice(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _system_prompt: Option<&str>,
        _tool_choice: ToolChoice,
    ) -> Result<LlmResponse> {
        anyhow::bail!("provider unavailable")
    }
}

/// Ambient context with fixed project and memory descriptions
pub struct StaticAmbient;

#[async_trait]
impl AmbientContext for StaticAmbient {
    async fn project_context(&self) -> Result<Message> {
        Ok(Message::user("Project: demo (Rust)"))
    }

    async fn memory_files_context(&self) -> Result<Message> {
        Ok(Message::user("No project knowledge files exist yet."))
    }
}

/// Shared log of `(role, request)` in the order workers were called
pub type CallLog = Arc<Mutex<Vec<(WorkerRole, WorkerRequest)>>>;

/// Worker that logs each request and answers with `"<role> done: <prompt>"`
pub struct RecordingWorker {
    role: WorkerRole,
    log: CallLog,
}

impl RecordingWorker {
    pub fn new(role: WorkerRole, log: CallLog) -> Self {
        Self { role, log }
    }
}

#[async_trait]
impl Worker for RecordingWorker {
    fn name(&self) -> &str {
        self.role.as_str()
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let text = format!("{} done: {}", self.role, request.prompt);
        self.log.lock().unwrap().push((self.role, request));
        Ok(WorkerOutput::text(text).with_usage(TokenUsage::new(10, 5), "worker-model"))
    }
}

/// Worker that always fails with the given message
pub struct FailingWorker {
    pub message: String,
}

#[async_trait]
impl Worker for FailingWorker {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _request: WorkerRequest) -> Result<WorkerOutput> {
        anyhow::bail!("{}", self.message)
    }
}

/// Registry with a recording worker for every role, sharing one log
pub fn recording_registry() -> (CapabilityRegistry, CallLog) {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CapabilityRegistry::new();
    for role in WorkerRole::ALL {
        registry.register(role, Arc::new(RecordingWorker::new(role, log.clone())));
    }
    (registry, log)
}

/// Orchestrator whose planner returns `plan` for every request
pub fn orchestrator_with_plan(
    plan: Value,
    registry: CapabilityRegistry,
    config: OrchestratorConfig,
) -> (OrchestratorAgent, Arc<ScriptedLlm>) {
    let llm = Arc::new(ScriptedLlm::new(plan));
    let agent = OrchestratorAgent::new(config, llm.clone(), registry, Arc::new(StaticAmbient));
    (agent, llm)
}

/// Prompts of the logged calls, in order
pub fn prompts(log: &CallLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .map(|(_, request)| request.prompt.clone())
        .collect()
}

/// Prompts of step dispatches only, without summary and checkpoint calls
pub fn step_prompts(log: &CallLog) -> Vec<String> {
    prompts(log)
        .into_iter()
        .filter(|p| !p.starts_with("Summarize") && !p.starts_with("Update the knowledge file"))
        .collect()
}
