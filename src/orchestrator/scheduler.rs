//! Step Scheduler
//!
//! Executes a plan one step at a time in dependency order. For every step the
//! completion is recorded first, then checkpoints fire, then the next runnable
//! step is selected; a failing worker changes none of that.

use crate::config::OrchestratorConfig;

use super::checkpoint::CheckpointTrigger;
use super::context::ExecutionContext;
use super::error::OrchestratorError;
use super::planner::repair_agent;
use super::propagation::summarize;
use super::registry::{CapabilityRegistry, WorkerOutput, WorkerRequest};
use super::types::{Plan, PlanEvent, Step, StepAgent, StepId, StepOutput};
use super::EventSink;

/// What happened to the steps of a plan that was executed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    /// `Step N (agent): description\n\nresult` per executed step
    pub step_results: Vec<String>,
    pub executed: usize,
    pub failed: usize,
    /// `Error executing step N: ...` for each failed step
    pub failures: Vec<String>,
    /// The step bound stopped execution with runnable steps left
    pub truncated: bool,
    /// Incomplete steps whose dependencies can never be met
    pub stalled: Vec<StepId>,
    pub checkpoints_fired: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// No plan, or a plan without steps
    NoSteps,
    /// Nothing could run even after the deadlock repair
    Deadlocked(String),
    Finished(ExecutionReport),
}

/// Context string listing each completed direct dependency and its result
pub fn dependency_context(plan: &Plan, step: &Step) -> String {
    let entries: Vec<String> = step
        .dependencies
        .iter()
        .filter_map(|dep| plan.find_step(*dep))
        .filter(|dep| dep.completed)
        .map(|dep| {
            let result = dep.result.as_ref().map(|r| r.to_string()).unwrap_or_default();
            format!("{}\nResult:\n{}", dep.header(), result)
        })
        .collect();

    if entries.is_empty() {
        String::new()
    } else {
        format!("Results from previous steps:\n\n{}", entries.join("\n\n"))
    }
}

pub struct Scheduler<'a> {
    registry: &'a CapabilityRegistry,
    config: &'a OrchestratorConfig,
    events: &'a EventSink,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        registry: &'a CapabilityRegistry,
        config: &'a OrchestratorConfig,
        events: &'a EventSink,
    ) -> Self {
        Self {
            registry,
            config,
            events,
        }
    }

    /// Repair invalid roles and report dependency cycles
    fn validate(&self, ctx: &mut ExecutionContext) {
        let Some(plan) = ctx.plan() else {
            return;
        };

        let repairs: Vec<(StepId, _)> = plan
            .steps
            .iter()
            .filter(|s| !s.completed)
            .filter_map(|s| {
                let mut step = s.clone();
                repair_agent(&mut step).map(|role| (s.id, role))
            })
            .collect();
        let cycle = plan.find_cycle();

        for (id, role) in repairs {
            ctx.repair_step_agent(id, role);
        }
        if let Some(cycle) = cycle {
            tracing::warn!("Plan contains a dependency cycle: {:?}", cycle);
            ctx.record_error(
                None,
                format!("Dependency cycle detected among steps {:?}", cycle),
                None,
            );
        }
    }

    /// Unblock a plan in which no step can run by clearing the dependencies
    /// of the first pending step, up to the configured number of attempts
    fn guard_deadlock(&self, ctx: &mut ExecutionContext) -> Result<(), OrchestratorError> {
        for attempt in 1..=self.config.deadlock_repair_attempts {
            let Some(plan) = ctx.plan() else {
                return Ok(());
            };
            if plan.has_runnable() || plan.all_completed() {
                return Ok(());
            }
            let Some(first) = plan
                .steps
                .iter()
                .find(|s| !s.completed && !s.dependencies.is_empty())
                .map(|s| s.id)
            else {
                break;
            };

            tracing::warn!(
                "No runnable step; clearing dependencies of step {} (attempt {})",
                first,
                attempt
            );
            ctx.clear_dependencies(first);
            ctx.record_error(
                Some(first),
                "Dependency deadlock: no step was runnable",
                Some(format!("Cleared the dependencies of step {}", first)),
            );
        }

        match ctx.plan() {
            Some(plan) if !plan.has_runnable() && !plan.all_completed() => {
                Err(OrchestratorError::Deadlock {
                    pending: plan.pending_ids(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn dispatch(&self, step: &Step, request: WorkerRequest) -> anyhow::Result<WorkerOutput> {
        let worker = match &step.agent {
            StepAgent::Role(role) => self.registry.resolve(*role)?,
            StepAgent::Unrecognized(name) => self.registry.resolve_name(name)?,
        };
        tracing::debug!("Dispatching step {} to worker '{}'", step.id, worker.name());
        worker.execute(request).await
    }

    async fn run_step(&self, ctx: &mut ExecutionContext, step: &Step, report: &mut ExecutionReport) {
        ctx.set_current_step(step.id);
        self.events.emit(PlanEvent::StepStarted {
            request_id: ctx.request_id().to_string(),
            step_id: step.id,
            agent: step.agent.to_string(),
            description: step.description.clone(),
        });
        tracing::info!("Executing {}", step.header());

        let additional = ctx
            .plan()
            .map(|plan| dependency_context(plan, step))
            .unwrap_or_default();
        let request = WorkerRequest::new(step.description.clone())
            .with_additional_context(additional)
            .with_context(summarize(ctx, step.id, self.config.context_recent_entries));

        let (output, success) = match self.dispatch(step, request).await {
            Ok(output) => {
                ctx.apply(output.records);
                if let Some(usage) = output.usage {
                    ctx.record_token_usage(&step.agent.to_string(), &usage.usage, &usage.model);
                }
                (output.value, true)
            }
            Err(e) => {
                let message = format!("Error executing step {}: {:#}", step.id, e);
                tracing::warn!("{}", message);
                ctx.record_error(
                    Some(step.id),
                    format!("{:#}", e),
                    Some("Step marked completed with the error as its result".to_string()),
                );
                report.failed += 1;
                report.failures.push(message.clone());
                (StepOutput::Text(message), false)
            }
        };

        report
            .step_results
            .push(format!("{}\n\n{}", step.header(), output));
        ctx.complete_step(step.id, output);
        report.executed += 1;

        self.events.emit(PlanEvent::StepCompleted {
            request_id: ctx.request_id().to_string(),
            step_id: step.id,
            success,
        });
    }

    /// Execute the plan stored in `ctx`
    pub async fn run(&self, ctx: &mut ExecutionContext) -> ScheduleOutcome {
        match ctx.plan() {
            Some(plan) if !plan.steps.is_empty() => {}
            _ => return ScheduleOutcome::NoSteps,
        }

        self.validate(ctx);

        if let Err(e) = self.guard_deadlock(ctx) {
            tracing::warn!("{}", e);
            ctx.record_error(None, e.to_string(), None);
            return ScheduleOutcome::Deadlocked(format!(
                "Unable to execute the plan: {}. Try rephrasing the request.",
                e
            ));
        }

        let mut report = ExecutionReport::default();
        let mut checkpoints = CheckpointTrigger::new();

        loop {
            let Some(step) = ctx.plan().and_then(|p| p.next_runnable()).cloned() else {
                break;
            };
            if report.executed >= self.config.max_steps {
                tracing::warn!(
                    "Step limit of {} reached; remaining steps skipped",
                    self.config.max_steps
                );
                report.truncated = true;
                break;
            }

            self.run_step(ctx, &step, &mut report).await;
            report.checkpoints_fired += checkpoints
                .fire(
                    ctx,
                    self.registry,
                    step.id,
                    self.config.context_recent_entries,
                    self.events,
                )
                .await;
        }

        if !report.truncated {
            report.stalled = ctx.plan().map(|p| p.pending_ids()).unwrap_or_default();
            if !report.stalled.is_empty() {
                tracing::warn!("Steps left unexecuted: {:?}", report.stalled);
                ctx.record_error(
                    None,
                    format!(
                        "Steps {:?} never became runnable because their dependencies were not met",
                        report.stalled
                    ),
                    None,
                );
            }
        }

        self.events.emit(PlanEvent::PlanCompleted {
            request_id: ctx.request_id().to_string(),
            executed_steps: report.executed,
            truncated: report.truncated,
        });

        ScheduleOutcome::Finished(report)
    }
}
