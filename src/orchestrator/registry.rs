//! Capability Registry
//!
//! Defines the `Worker` trait every step executor implements and the
//! per-request registry that maps a `WorkerRole` to a live worker.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::TokenUsage;

use super::context::ResourceRecord;
use super::error::OrchestratorError;
use super::propagation::ContextSummary;
use super::role::WorkerRole;
use super::types::StepOutput;

/// What the scheduler hands a worker for one step
#[derive(Debug, Clone, Default)]
pub struct WorkerRequest {
    /// Step description (or checkpoint instruction)
    pub prompt: String,
    /// Results of the step's dependencies, or other caller-supplied detail
    pub additional_context: Option<String>,
    /// Read-only snapshot of the execution context
    pub context: Option<ContextSummary>,
}

impl WorkerRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            additional_context: None,
            context: None,
        }
    }

    pub fn with_additional_context(mut self, additional: impl Into<String>) -> Self {
        let additional = additional.into();
        self.additional_context = (!additional.is_empty()).then_some(additional);
        self
    }

    pub fn with_context(mut self, context: ContextSummary) -> Self {
        self.context = Some(context);
        self
    }
}

/// Token usage a worker spent, with the model that spent it
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub usage: TokenUsage,
    pub model: String,
}

/// Value returned by a worker; the scheduler records it
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub value: StepOutput,
    pub records: Vec<ResourceRecord>,
    pub usage: Option<UsageRecord>,
}

impl WorkerOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            value: StepOutput::Text(text.into()),
            records: Vec::new(),
            usage: None,
        }
    }

    pub fn object(value: serde_json::Value) -> Self {
        Self {
            value: StepOutput::Object(value),
            records: Vec::new(),
            usage: None,
        }
    }

    pub fn with_records(mut self, records: Vec<ResourceRecord>) -> Self {
        self.records = records;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage, model: impl Into<String>) -> Self {
        self.usage = Some(UsageRecord {
            usage,
            model: model.into(),
        });
        self
    }
}

/// A specialized agent that executes plan steps of one role
#[async_trait]
pub trait Worker: Send + Sync {
    /// Worker name (for logging/display)
    fn name(&self) -> &str;

    /// Execute one request; failures are returned, never panicked
    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput>;
}

/// Maps each role to the worker that serves it
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    workers: HashMap<WorkerRole, Arc<dyn Worker>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the worker for a role
    pub fn register(&mut self, role: WorkerRole, worker: Arc<dyn Worker>) {
        tracing::debug!("Registering worker '{}' for role {}", worker.name(), role);
        self.workers.insert(role, worker);
    }

    /// Builder-style registration
    pub fn with_worker(mut self, role: WorkerRole, worker: Arc<dyn Worker>) -> Self {
        self.register(role, worker);
        self
    }

    pub fn resolve(&self, role: WorkerRole) -> Result<Arc<dyn Worker>, OrchestratorError> {
        self.workers
            .get(&role)
            .cloned()
            .ok_or(OrchestratorError::WorkerNotRegistered(role))
    }

    /// Resolve a role given by name; anything but the five roles is rejected
    pub fn resolve_name(&self, name: &str) -> Result<Arc<dyn Worker>, OrchestratorError> {
        let role: WorkerRole = name.parse()?;
        self.resolve(role)
    }

    pub fn has(&self, role: WorkerRole) -> bool {
        self.workers.contains_key(&role)
    }

    /// Registered roles in declaration order
    pub fn roles(&self) -> Vec<WorkerRole> {
        WorkerRole::ALL
            .into_iter()
            .filter(|role| self.has(*role))
            .collect()
    }

    pub fn clear(&mut self) {
        self.workers.clear();
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
