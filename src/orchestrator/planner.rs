//! Plan Generator
//!
//! Turns a free-form request into a `Plan` through schema-constrained
//! generation, then normalizes whatever the model produced into a plan the
//! scheduler can trust.

use anyhow::Result;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::llm::{generate_object, LlmClient, Message};
use crate::project::AmbientContext;

use super::context::ExecutionContext;
use super::error::OrchestratorError;
use super::propagation::{embed_context, project, Visibility};
use super::role::WorkerRole;
use super::types::{MemoryCheckpoint, Plan, Severity, Step, StepAgent, StepId};

/// Agent name under which planning usage is recorded
pub const PLANNER_AGENT: &str = "orchestrator";

const PLAN_TOOL_NAME: &str = "submit_plan";
const PLAN_TOOL_DESCRIPTION: &str = "Submit the execution plan for the user's request";

const PLANNING_SYSTEM_PROMPT: &str = r#"You are the planning component of stepwise, an AI coding assistant working inside a software project. Break the user's request into a small, dependency-ordered plan that specialized workers will execute one step at a time.

## Task Categories
Classify the request in `taskCategory` with a short label such as: bugfix, feature, refactor, question, documentation, investigation, testing, configuration.
Set `severity` (critical, major, minor, none) only for bug reports and incidents; omit it otherwise.

## Workers
Assign every step to exactly one of these agents:
{roles}

## Dependency Rules
1. Step ids are unique positive integers, starting at 1.
2. `dependencies` lists the ids of steps whose results this step needs.
3. A step never depends on itself and dependencies never form a cycle.
4. Prefer searching before changing and verifying after changing.
5. Keep plans short: most requests need 2-6 steps.

## Memory Checkpoints
When a step produces knowledge worth keeping (architecture, conventions, decisions), add an entry to `memoryUpdatePoints` naming the step (`afterStep`), the knowledge file to update (`filePath`, relative, markdown) and what to record.

## Search Keywords
List identifiers, file names and phrases the search worker should look for in `searchKeywords`.

## Output Contract
Call the `submit_plan` tool exactly once with the complete plan. Do not answer the request yourself."#;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct PlanDraft {
    /// Short classification of the request
    task_category: String,
    /// Only for bug reports and incidents
    #[serde(default)]
    severity: Option<Severity>,
    steps: Vec<StepDraft>,
    #[serde(default)]
    search_keywords: Vec<String>,
    #[serde(default)]
    memory_update_points: Vec<MemoryCheckpoint>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct StepDraft {
    /// Unique positive integer
    id: StepId,
    /// What the worker should do, in one or two sentences
    description: String,
    #[schemars(with = "WorkerRole")]
    agent: String,
    /// Ids of steps that must complete first
    #[serde(default)]
    dependencies: Vec<StepId>,
}

impl From<PlanDraft> for Plan {
    fn from(draft: PlanDraft) -> Self {
        Plan {
            task_category: draft.task_category,
            severity: draft.severity,
            steps: draft
                .steps
                .into_iter()
                .map(|s| Step::new(s.id, s.description, StepAgent::from_name(&s.agent)).depends_on(s.dependencies))
                .collect(),
            search_keywords: draft.search_keywords,
            memory_update_points: draft.memory_update_points,
        }
    }
}

/// Bring a plan into the shape the scheduler relies on.
///
/// Every step starts incomplete with no result; invalid ids, unknown roles,
/// bad dependencies and unbound checkpoints are repaired or dropped.
pub fn normalize_plan(plan: Plan) -> Plan {
    let mut seen: HashSet<StepId> = HashSet::new();
    let mut steps: Vec<Step> = Vec::with_capacity(plan.steps.len());

    for mut step in plan.steps {
        if step.id == 0 {
            tracing::warn!("Dropping step with invalid id 0: {}", step.description);
            continue;
        }
        if !seen.insert(step.id) {
            tracing::warn!("Dropping duplicate step id {}: {}", step.id, step.description);
            continue;
        }
        step.completed = false;
        step.result = None;
        repair_agent(&mut step);
        steps.push(step);
    }

    let ids: HashSet<StepId> = steps.iter().map(|s| s.id).collect();
    for step in &mut steps {
        let id = step.id;
        let mut kept: HashSet<StepId> = HashSet::new();
        step.dependencies.retain(|dep| {
            if *dep == id {
                tracing::warn!("Step {} depended on itself; dependency removed", id);
                false
            } else if !ids.contains(dep) {
                tracing::warn!("Step {} depended on unknown step {}; dependency removed", id, dep);
                false
            } else {
                kept.insert(*dep)
            }
        });
    }

    let memory_update_points = plan
        .memory_update_points
        .into_iter()
        .filter(|cp| {
            let known = ids.contains(&cp.after_step);
            if !known {
                tracing::warn!(
                    "Dropping memory checkpoint for unknown step {} ({})",
                    cp.after_step,
                    cp.file_path
                );
            }
            known
        })
        .collect();

    Plan {
        task_category: plan.task_category,
        severity: plan.severity,
        steps,
        search_keywords: plan.search_keywords,
        memory_update_points,
    }
}

/// Replace an unrecognized agent with a role guessed from the description.
/// Returns the repaired role, if a repair happened.
pub fn repair_agent(step: &mut Step) -> Option<WorkerRole> {
    let StepAgent::Unrecognized(name) = &step.agent else {
        return None;
    };
    let role = WorkerRole::infer_from_description(&step.description);
    tracing::warn!(
        "Step {} had invalid agent '{}'; reassigned to {}",
        step.id,
        name,
        role
    );
    step.agent = StepAgent::Role(role);
    Some(role)
}

fn system_prompt() -> String {
    let roles = WorkerRole::ALL
        .iter()
        .map(|role| format!("- `{}`: {}", role, role.selection_criteria()))
        .collect::<Vec<_>>()
        .join("\n");
    PLANNING_SYSTEM_PROMPT.replace("{roles}", &roles)
}

/// Generates plans for requests
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    ambient: Arc<dyn AmbientContext>,
    schema_attempts: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, ambient: Arc<dyn AmbientContext>, schema_attempts: usize) -> Self {
        Self {
            llm,
            ambient,
            schema_attempts,
        }
    }

    async fn build_messages(
        &self,
        ctx: &ExecutionContext,
        description: &str,
        additional_context: Option<&str>,
    ) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        match self.ambient.project_context().await {
            Ok(message) => messages.push(message),
            Err(e) => tracing::warn!("Project context unavailable: {:#}", e),
        }
        match self.ambient.memory_files_context().await {
            Ok(message) => messages.push(message),
            Err(e) => tracing::warn!("Memory inventory unavailable: {:#}", e),
        }

        let full = project(ctx, Visibility::Full, None)?;
        embed_context(&mut messages, &full)?;

        let mut request = format!("User request:\n{}", description);
        if let Some(additional) = additional_context.filter(|a| !a.trim().is_empty()) {
            request.push_str("\n\nAdditional context:\n");
            request.push_str(additional);
        }
        messages.push(Message::user(request));

        Ok(messages)
    }

    /// Generate, normalize and store a plan in `ctx`.
    ///
    /// Fails with `OrchestratorError::PlanGeneration` when no schema-conforming
    /// plan could be produced; nothing is stored in that case.
    pub async fn create_plan(
        &self,
        ctx: &mut ExecutionContext,
        description: &str,
        additional_context: Option<&str>,
    ) -> Result<Plan> {
        let messages = self.build_messages(ctx, description, additional_context).await?;

        tracing::info!("Generating plan for request {}", ctx.request_id());
        let generated = generate_object::<PlanDraft>(
            self.llm.as_ref(),
            &system_prompt(),
            &messages,
            PLAN_TOOL_NAME,
            PLAN_TOOL_DESCRIPTION,
            self.schema_attempts,
        )
        .await
        .map_err(|e| OrchestratorError::PlanGeneration(format!("{:#}", e)))?;

        ctx.record_token_usage(PLANNER_AGENT, &generated.usage, &generated.model);

        let plan = normalize_plan(generated.value.into());
        tracing::info!(
            "Plan created: {} ({} steps, {} checkpoints)",
            plan.task_category,
            plan.steps.len(),
            plan.memory_update_points.len()
        );
        ctx.set_plan(plan.clone());
        Ok(plan)
    }
}
