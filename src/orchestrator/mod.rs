//! Plan Orchestration Engine
//!
//! Turns a user request into a dependency-ordered plan, runs each step on the
//! worker registered for its role and condenses the step results into one
//! answer. All state of a request lives in its `ExecutionContext`; the
//! `OrchestratorAgent` owns that context and is its only writer.

pub mod checkpoint;
pub mod context;
pub mod error;
pub mod planner;
pub mod propagation;
pub mod registry;
pub mod role;
pub mod scheduler;
pub mod summarizer;
pub mod types;

pub use context::{ExecutionContext, ResourceRecord};
pub use error::OrchestratorError;
pub use planner::Planner;
pub use propagation::{extract_context, ContextSummary, Visibility};
pub use registry::{CapabilityRegistry, UsageRecord, Worker, WorkerOutput, WorkerRequest};
pub use role::WorkerRole;
pub use scheduler::{ExecutionReport, ScheduleOutcome, Scheduler};
pub use types::{MemoryCheckpoint, Plan, PlanEvent, Severity, Step, StepAgent, StepId, StepOutput};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::OrchestratorConfig;
use crate::llm::{LlmClient, Message};
use crate::project::AmbientContext;

pub const NO_STEPS_MESSAGE: &str = "No steps to execute: the plan is empty.";

/// Optional channel for plan events
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<PlanEvent>>);

impl EventSink {
    pub fn new(tx: UnboundedSender<PlanEvent>) -> Self {
        Self(Some(tx))
    }

    /// Send an event; a closed or missing receiver is ignored
    pub fn emit(&self, event: PlanEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Entry point for planning and executing one request at a time
pub struct OrchestratorAgent {
    config: OrchestratorConfig,
    planner: Planner,
    registry: CapabilityRegistry,
    context: ExecutionContext,
    request: Option<String>,
    events: EventSink,
}

impl OrchestratorAgent {
    pub fn new(
        config: OrchestratorConfig,
        llm: Arc<dyn LlmClient>,
        registry: CapabilityRegistry,
        ambient: Arc<dyn AmbientContext>,
    ) -> Self {
        let planner = Planner::new(llm, ambient, config.schema_attempts);
        let context = ExecutionContext::new(config.user_id.clone());
        Self {
            config,
            planner,
            registry,
            context,
            request: None,
            events: EventSink::default(),
        }
    }

    /// Report progress on the given channel
    pub fn with_events(mut self, tx: UnboundedSender<PlanEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.context.plan()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CapabilityRegistry {
        &mut self.registry
    }

    /// Drop the current request's state and start a new context
    fn start_request(&mut self, request: Option<&str>) {
        self.context = ExecutionContext::new(self.config.user_id.clone());
        self.request = request.map(str::to_string);
        tracing::debug!("Started request {}", self.context.request_id());
    }

    /// Continue with a context embedded in a message set, or start fresh when
    /// none can be recovered. Returns whether a context was recovered.
    pub fn restore_context(&mut self, messages: &[Message]) -> bool {
        match extract_context(messages) {
            Some(context) => {
                tracing::info!("Resuming request {}", context.request_id());
                self.context = context;
                true
            }
            None => {
                self.start_request(None);
                false
            }
        }
    }

    fn emit_plan_created(&self, plan: &Plan) {
        self.events.emit(PlanEvent::PlanCreated {
            request_id: self.context.request_id().to_string(),
            task_category: plan.task_category.clone(),
            total_steps: plan.steps.len(),
        });
    }

    /// Generate the plan for a new request.
    ///
    /// Starts a fresh context. On failure no plan is stored and the error
    /// (an `OrchestratorError::PlanGeneration`) is returned.
    pub async fn create_plan(
        &mut self,
        description: &str,
        additional_context: Option<&str>,
    ) -> Result<Plan> {
        self.start_request(Some(description));
        let plan = self
            .planner
            .create_plan(&mut self.context, description, additional_context)
            .await?;
        self.emit_plan_created(&plan);
        Ok(plan)
    }

    /// Install a prepared plan for a new request; it is normalized like a
    /// generated one
    pub fn load_plan(&mut self, plan: Plan) -> Plan {
        self.start_request(None);
        let plan = planner::normalize_plan(plan);
        self.context.set_plan(plan.clone());
        self.emit_plan_created(&plan);
        plan
    }

    /// Execute the stored plan and return the final answer. Never fails:
    /// every problem ends up in the answer or in the context's error log.
    pub async fn execute_plan(&mut self) -> String {
        let scheduler = Scheduler::new(&self.registry, &self.config, &self.events);
        let report = match scheduler.run(&mut self.context).await {
            ScheduleOutcome::NoSteps => return NO_STEPS_MESSAGE.to_string(),
            ScheduleOutcome::Deadlocked(message) => return message,
            ScheduleOutcome::Finished(report) => report,
        };

        let mut answer = summarizer::summarize_results(
            &mut self.context,
            &self.registry,
            self.request.as_deref(),
            &report.step_results,
        )
        .await;

        if report.truncated {
            let remaining = self.context.plan().map(|p| p.pending_ids().len()).unwrap_or(0);
            answer.push_str(&format!(
                "\n\nNote: execution was truncated after {} steps; {} step(s) were not run.",
                report.executed, remaining
            ));
        }
        if !report.failures.is_empty() {
            answer.push_str("\n\nFailed steps:");
            for failure in &report.failures {
                answer.push_str("\n- ");
                answer.push_str(failure);
            }
        }
        if !report.stalled.is_empty() {
            answer.push_str(&format!(
                "\n\nNote: steps {:?} were not run because their dependencies never completed.",
                report.stalled
            ));
        }

        tracing::info!(
            "Request {} finished: {} steps executed, {} failed, {} tokens",
            self.context.request_id(),
            report.executed,
            report.failed,
            self.context.total_tokens()
        );
        answer
    }

    /// Plan and execute a request
    pub async fn handle_request(
        &mut self,
        description: &str,
        additional_context: Option<&str>,
    ) -> Result<String> {
        self.create_plan(description, additional_context).await?;
        Ok(self.execute_plan().await)
    }
}
