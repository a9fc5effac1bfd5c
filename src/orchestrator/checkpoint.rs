//! Memory Checkpoint Trigger
//!
//! After a step completes, every checkpoint bound to it asks the memory
//! worker to persist what the step (and its direct dependencies) found.
//! A failed update is logged in the context and never blocks the plan.

use std::collections::HashSet;

use super::context::ExecutionContext;
use super::propagation::summarize;
use super::registry::{CapabilityRegistry, WorkerRequest};
use super::role::WorkerRole;
use super::types::{MemoryCheckpoint, Plan, PlanEvent, StepId};
use super::EventSink;

/// `Step id (agent): description -> result` for the step and its completed
/// direct dependencies, in plan order
pub fn checkpoint_lines(plan: &Plan, step_id: StepId) -> Vec<String> {
    let Some(step) = plan.find_step(step_id) else {
        return Vec::new();
    };
    plan.steps
        .iter()
        .filter(|s| s.id == step_id || step.dependencies.contains(&s.id))
        .filter(|s| s.completed)
        .map(|s| {
            let result = s.result.as_ref().map(|r| r.to_string()).unwrap_or_default();
            format!("{} -> {}", s.header(), result)
        })
        .collect()
}

fn instruction(checkpoint: &MemoryCheckpoint, lines: &[String]) -> String {
    format!(
        "Update the knowledge file `{}`.\nWhat to record: {}\n\nStep results:\n{}",
        checkpoint.file_path,
        checkpoint.description,
        lines.join("\n")
    )
}

/// Fires each checkpoint at most once per plan
#[derive(Debug, Default)]
pub struct CheckpointTrigger {
    fired: HashSet<usize>,
}

impl CheckpointTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the checkpoints bound to `step_id`; returns how many ran
    pub async fn fire(
        &mut self,
        ctx: &mut ExecutionContext,
        registry: &CapabilityRegistry,
        step_id: StepId,
        recent_entries: usize,
        events: &EventSink,
    ) -> usize {
        let Some(plan) = ctx.plan() else {
            return 0;
        };
        if !plan.is_completed(step_id) {
            return 0;
        }

        let pending: Vec<(usize, MemoryCheckpoint)> = plan
            .checkpoints_after(step_id)
            .into_iter()
            .filter(|(index, _)| !self.fired.contains(index))
            .map(|(index, cp)| (index, cp.clone()))
            .collect();
        if pending.is_empty() {
            return 0;
        }
        let lines = checkpoint_lines(plan, step_id);

        for (index, checkpoint) in &pending {
            self.fired.insert(*index);
            tracing::info!(
                "Memory checkpoint after step {}: updating {}",
                step_id,
                checkpoint.file_path
            );

            let request = WorkerRequest::new(instruction(checkpoint, &lines))
                .with_context(summarize(ctx, step_id, recent_entries));

            let outcome = match registry.resolve(WorkerRole::Memory) {
                Ok(worker) => worker.execute(request).await,
                Err(e) => Err(e.into()),
            };

            let success = match outcome {
                Ok(output) => {
                    ctx.apply(output.records);
                    if let Some(usage) = output.usage {
                        ctx.record_token_usage(WorkerRole::Memory.as_str(), &usage.usage, &usage.model);
                    }
                    true
                }
                Err(e) => {
                    tracing::warn!("Memory checkpoint after step {} failed: {:#}", step_id, e);
                    ctx.record_error(Some(step_id), format!("Memory update error: {:#}", e), None);
                    false
                }
            };

            events.emit(PlanEvent::CheckpointFired {
                request_id: ctx.request_id().to_string(),
                step_id,
                file_path: checkpoint.file_path.clone(),
                success,
            });
        }

        pending.len()
    }
}
