//! Shared Execution Context
//!
//! One `ExecutionContext` exists per request. It holds the plan and everything
//! workers have touched while executing it. Fields are private: state changes
//! go through the recorder methods below, resource logs only ever grow, and
//! the only in-place plan changes are step completion, role repair and the
//! deadlock repair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::llm::TokenUsage;

use super::role::WorkerRole;
use super::types::{Plan, StepAgent, StepId, StepOutput};

/// Inclusive 1-based line range of a file read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// A file a worker read, with the line ranges it looked at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRead {
    pub path: String,
    pub lines: Vec<LineRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command: String,
    pub result: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchRecord {
    pub query: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub step: Option<StepId>,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateResult {
    pub step: StepId,
    pub agent: String,
    pub output: StepOutput,
}

/// Accumulated token usage of one agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub model: String,
}

/// Something a worker touched, reported back to the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceRecord {
    FileSearched(String),
    FileRead {
        path: String,
        lines: Option<LineRange>,
    },
    Command(CommandRecord),
    WebSearch(WebSearchRecord),
    MemoryCreated(String),
    MemoryRead(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    request_id: String,
    user_id: String,
    timestamp: DateTime<Utc>,
    current_step: Option<StepId>,
    total_steps: usize,
    plan: Option<Plan>,
    files_searched: Vec<String>,
    files_read: Vec<FileRead>,
    commands_executed: Vec<CommandRecord>,
    web_searches: Vec<WebSearchRecord>,
    memory_created: Vec<String>,
    memory_read: Vec<String>,
    intermediate_results: Vec<IntermediateResult>,
    errors: Vec<ErrorEntry>,
    token_usage: BTreeMap<String, AgentUsage>,
}

impl ExecutionContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            current_step: None,
            total_steps: 0,
            plan: None,
            files_searched: Vec::new(),
            files_read: Vec::new(),
            commands_executed: Vec::new(),
            web_searches: Vec::new(),
            memory_created: Vec::new(),
            memory_read: Vec::new(),
            intermediate_results: Vec::new(),
            errors: Vec::new(),
            token_usage: BTreeMap::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn current_step(&self) -> Option<StepId> {
        self.current_step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn files_searched(&self) -> &[String] {
        &self.files_searched
    }

    /// Files read so far, least recently read first
    pub fn files_read(&self) -> &[FileRead] {
        &self.files_read
    }

    pub fn commands_executed(&self) -> &[CommandRecord] {
        &self.commands_executed
    }

    pub fn web_searches(&self) -> &[WebSearchRecord] {
        &self.web_searches
    }

    pub fn memory_created(&self) -> &[String] {
        &self.memory_created
    }

    pub fn memory_read(&self) -> &[String] {
        &self.memory_read
    }

    pub fn intermediate_results(&self) -> &[IntermediateResult] {
        &self.intermediate_results
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn token_usage(&self) -> &BTreeMap<String, AgentUsage> {
        &self.token_usage
    }

    /// Install the plan for this request and reset step tracking
    pub fn set_plan(&mut self, plan: Plan) {
        self.total_steps = plan.steps.len();
        self.current_step = None;
        self.plan = Some(plan);
    }

    pub fn set_current_step(&mut self, id: StepId) {
        self.current_step = Some(id);
    }

    /// Mark a step completed with its result.
    ///
    /// Returns false when the step does not exist or was already completed;
    /// a completed step is never overwritten.
    pub fn complete_step(&mut self, id: StepId, output: StepOutput) -> bool {
        let Some(step) = self.plan.as_mut().and_then(|p| p.find_step_mut(id)) else {
            return false;
        };
        if step.completed {
            return false;
        }
        step.completed = true;
        step.result = Some(output.clone());
        let agent = step.agent.to_string();
        self.intermediate_results.push(IntermediateResult {
            step: id,
            agent,
            output,
        });
        true
    }

    /// Replace the agent of a not-yet-completed step
    pub fn repair_step_agent(&mut self, id: StepId, role: WorkerRole) -> bool {
        match self.plan.as_mut().and_then(|p| p.find_step_mut(id)) {
            Some(step) if !step.completed => {
                step.agent = StepAgent::Role(role);
                true
            }
            _ => false,
        }
    }

    /// Drop every dependency of a step (deadlock repair)
    pub fn clear_dependencies(&mut self, id: StepId) -> bool {
        match self.plan.as_mut().and_then(|p| p.find_step_mut(id)) {
            Some(step) if !step.completed => {
                step.dependencies.clear();
                true
            }
            _ => false,
        }
    }

    pub fn record_file_searched(&mut self, path: impl Into<String>) {
        self.files_searched.push(path.into());
    }

    /// Record a read; reading a known file again moves it to the end
    pub fn record_file_read(&mut self, path: impl Into<String>, lines: Option<LineRange>) {
        let path = path.into();
        let mut entry = match self.files_read.iter().position(|f| f.path == path) {
            Some(pos) => self.files_read.remove(pos),
            None => FileRead {
                path,
                lines: Vec::new(),
            },
        };
        entry.lines.extend(lines);
        self.files_read.push(entry);
    }

    pub fn record_command(&mut self, record: CommandRecord) {
        self.commands_executed.push(record);
    }

    pub fn record_web_search(&mut self, record: WebSearchRecord) {
        self.web_searches.push(record);
    }

    pub fn record_memory_created(&mut self, path: impl Into<String>) {
        self.memory_created.push(path.into());
    }

    pub fn record_memory_read(&mut self, path: impl Into<String>) {
        self.memory_read.push(path.into());
    }

    pub fn record_error(
        &mut self,
        step: Option<StepId>,
        error: impl Into<String>,
        recovery: Option<String>,
    ) {
        self.errors.push(ErrorEntry {
            step,
            error: error.into(),
            recovery,
        });
    }

    /// Add a usage sample to the agent's running total
    pub fn record_token_usage(&mut self, agent: &str, usage: &TokenUsage, model: &str) {
        let entry = self.token_usage.entry(agent.to_string()).or_default();
        entry.prompt_tokens += usage.input_tokens;
        entry.completion_tokens += usage.output_tokens;
        entry.model = model.to_string();
    }

    /// Apply the resource records a worker returned
    pub fn apply(&mut self, records: Vec<ResourceRecord>) {
        for record in records {
            match record {
                ResourceRecord::FileSearched(path) => self.record_file_searched(path),
                ResourceRecord::FileRead { path, lines } => self.record_file_read(path, lines),
                ResourceRecord::Command(record) => self.record_command(record),
                ResourceRecord::WebSearch(record) => self.record_web_search(record),
                ResourceRecord::MemoryCreated(path) => self.record_memory_created(path),
                ResourceRecord::MemoryRead(path) => self.record_memory_read(path),
            }
        }
    }

    /// Total tokens across all agents
    pub fn total_tokens(&self) -> usize {
        self.token_usage
            .values()
            .map(|u| u.prompt_tokens + u.completion_tokens)
            .sum()
    }
}
