//! Context Propagation Policy
//!
//! Decides how much of the execution context a consumer sees. The planner gets
//! the full serialized context; every dispatched step gets a `ContextSummary`
//! holding only the step, its direct dependencies and the most recent
//! resource log entries.
//!
//! Either view travels inside the message set as a dedicated message wrapped
//! in sentinel markers, so it can be found and replaced later.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::llm::{ContentBlock, Message};

use super::context::{CommandRecord, ExecutionContext, FileRead, WebSearchRecord};
use super::types::{Step, StepId};

pub const CONTEXT_BEGIN: &str = "<<<STEPWISE_EXECUTION_CONTEXT>>>";
pub const CONTEXT_END: &str = "<<<END_STEPWISE_EXECUTION_CONTEXT>>>";

/// How much of the context a consumer may see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Everything; plan generation only
    Full,
    /// Current step, its dependencies and the last `recent_entries` log entries
    Summarized { recent_entries: usize },
}

/// Restricted snapshot handed to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub request_id: String,
    pub user_id: String,
    pub current_step: Option<StepId>,
    pub total_steps: usize,
    pub completed_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    /// Direct dependencies of `step`, with their results
    #[serde(default)]
    pub dependencies: Vec<Step>,
    #[serde(default)]
    pub recent_files_read: Vec<FileRead>,
    #[serde(default)]
    pub recent_commands: Vec<CommandRecord>,
    #[serde(default)]
    pub recent_web_searches: Vec<WebSearchRecord>,
    pub error_count: usize,
}

fn last_n<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}

/// Summarized view of `ctx` for the given step.
///
/// The current step's own result is never part of the view, and other steps
/// only appear when they are direct dependencies.
pub fn summarize(ctx: &ExecutionContext, step_id: StepId, recent_entries: usize) -> ContextSummary {
    let plan = ctx.plan();
    let step = plan.and_then(|p| p.find_step(step_id)).cloned().map(|mut s| {
        s.result = None;
        s
    });
    let dependencies = match (plan, &step) {
        (Some(plan), Some(step)) => step
            .dependencies
            .iter()
            .filter_map(|dep| plan.find_step(*dep).cloned())
            .map(|mut dep| {
                dep.dependencies.clear();
                dep
            })
            .collect(),
        _ => Vec::new(),
    };

    ContextSummary {
        request_id: ctx.request_id().to_string(),
        user_id: ctx.user_id().to_string(),
        current_step: ctx.current_step(),
        total_steps: ctx.total_steps(),
        completed_steps: plan.map(|p| p.completed_count()).unwrap_or(0),
        task_category: plan.map(|p| p.task_category.clone()),
        step,
        dependencies,
        recent_files_read: last_n(ctx.files_read(), recent_entries),
        recent_commands: last_n(ctx.commands_executed(), recent_entries),
        recent_web_searches: last_n(ctx.web_searches(), recent_entries),
        error_count: ctx.errors().len(),
    }
}

/// Serialized view of `ctx` under the given visibility
pub fn project(
    ctx: &ExecutionContext,
    visibility: Visibility,
    step_id: Option<StepId>,
) -> Result<serde_json::Value> {
    match visibility {
        Visibility::Full => {
            serde_json::to_value(ctx).context("Failed to serialize execution context")
        }
        Visibility::Summarized { recent_entries } => {
            let step_id = step_id.or(ctx.current_step()).unwrap_or_default();
            serde_json::to_value(summarize(ctx, step_id, recent_entries))
                .context("Failed to serialize context summary")
        }
    }
}

fn is_context_message(message: &Message) -> bool {
    message.content.iter().any(|block| {
        matches!(block, ContentBlock::Text { text } if text.contains(CONTEXT_BEGIN))
    })
}

/// Put `payload` into the message set, replacing an earlier context message
pub fn embed_context<T: Serialize>(messages: &mut Vec<Message>, payload: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(payload).context("Failed to serialize context")?;
    let message = Message::user(format!(
        "Execution context (JSON):\n{}\n{}\n{}",
        CONTEXT_BEGIN, json, CONTEXT_END
    ));

    match messages.iter().position(is_context_message) {
        Some(pos) => messages[pos] = message,
        None => messages.insert(0, message),
    }
    Ok(())
}

/// Locate and deserialize an embedded payload
pub fn extract_payload<T: DeserializeOwned>(messages: &[Message]) -> Option<T> {
    let text = messages
        .iter()
        .find(|m| is_context_message(m))
        .map(|m| m.text())?;
    let start = text.find(CONTEXT_BEGIN)? + CONTEXT_BEGIN.len();
    let end = text[start..].find(CONTEXT_END)? + start;

    match serde_json::from_str(text[start..end].trim()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::debug!("Ignoring unreadable embedded context: {}", e);
            None
        }
    }
}

/// Recover a full execution context; `None` means start a fresh one
pub fn extract_context(messages: &[Message]) -> Option<ExecutionContext> {
    extract_payload(messages)
}
