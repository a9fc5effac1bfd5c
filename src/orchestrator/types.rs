//! Plan Types
//!
//! Plans, steps and checkpoints as produced by the planner and mutated by the
//! scheduler. Serialized field names follow the camelCase wire contract the
//! planner asks the model for.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::role::WorkerRole;

/// Step identifier, unique within a plan
pub type StepId = u32;

/// How severe the reported problem is (bug reports and incidents)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    /// Explicitly rated as not a problem
    #[serde(rename = "none")]
    Negligible,
}

/// The worker a step is assigned to.
///
/// Model output may name a role that does not exist; it is kept verbatim until
/// role repair replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepAgent {
    Role(WorkerRole),
    Unrecognized(String),
}

impl StepAgent {
    pub fn from_name(name: &str) -> Self {
        match WorkerRole::parse(name) {
            Some(role) => StepAgent::Role(role),
            None => StepAgent::Unrecognized(name.to_string()),
        }
    }

    pub fn role(&self) -> Option<WorkerRole> {
        match self {
            StepAgent::Role(role) => Some(*role),
            StepAgent::Unrecognized(_) => None,
        }
    }
}

impl From<WorkerRole> for StepAgent {
    fn from(role: WorkerRole) -> Self {
        StepAgent::Role(role)
    }
}

impl fmt::Display for StepAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAgent::Role(role) => write!(f, "{}", role),
            StepAgent::Unrecognized(name) => write!(f, "{}", name),
        }
    }
}

/// Value produced by a completed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum StepOutput {
    Text(String),
    Object(serde_json::Value),
}

impl From<String> for StepOutput {
    fn from(text: String) -> Self {
        StepOutput::Text(text)
    }
}

impl From<&str> for StepOutput {
    fn from(text: &str) -> Self {
        StepOutput::Text(text.to_string())
    }
}

impl fmt::Display for StepOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutput::Text(text) => f.write_str(text),
            StepOutput::Object(value) => match serde_json::to_string_pretty(value) {
                Ok(json) => f.write_str(&json),
                Err(_) => write!(f, "{}", value),
            },
        }
    }
}

/// A single unit of work in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub description: String,
    pub agent: StepAgent,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub result: Option<StepOutput>,
}

impl Step {
    pub fn new(id: StepId, description: impl Into<String>, agent: impl Into<StepAgent>) -> Self {
        Self {
            id,
            description: description.into(),
            agent: agent.into(),
            dependencies: Vec::new(),
            completed: false,
            result: None,
        }
    }

    /// Set the steps this one waits for
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = StepId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    /// `Step N (agent): description`
    pub fn header(&self) -> String {
        format!("Step {} ({}): {}", self.id, self.agent, self.description)
    }
}

/// Persist knowledge once a given step has completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCheckpoint {
    /// Step whose completion triggers this checkpoint
    pub after_step: StepId,
    /// Knowledge file to update, relative to the memory directory
    pub file_path: String,
    /// What the update should capture
    pub description: String,
}

/// A dependency-ordered execution plan for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub task_category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub search_keywords: Vec<String>,
    #[serde(default)]
    pub memory_update_points: Vec<MemoryCheckpoint>,
}

impl Plan {
    pub fn new(task_category: impl Into<String>) -> Self {
        Self {
            task_category: task_category.into(),
            severity: None,
            steps: Vec::new(),
            search_keywords: Vec::new(),
            memory_update_points: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: MemoryCheckpoint) -> Self {
        self.memory_update_points.push(checkpoint);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn find_step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn find_step_mut(&mut self, id: StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn is_completed(&self, id: StepId) -> bool {
        self.find_step(id).map(|s| s.completed).unwrap_or(false)
    }

    /// Not completed, and every dependency exists and is completed
    pub fn is_runnable(&self, step: &Step) -> bool {
        !step.completed && step.dependencies.iter().all(|dep| self.is_completed(*dep))
    }

    /// The runnable step with the lowest id
    pub fn next_runnable(&self) -> Option<&Step> {
        self.steps
            .iter()
            .filter(|s| self.is_runnable(s))
            .min_by_key(|s| s.id)
    }

    pub fn has_runnable(&self) -> bool {
        self.steps.iter().any(|s| self.is_runnable(s))
    }

    pub fn all_completed(&self) -> bool {
        self.steps.iter().all(|s| s.completed)
    }

    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.completed).count()
    }

    /// Ids of steps not yet completed, in plan order
    pub fn pending_ids(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| !s.completed)
            .map(|s| s.id)
            .collect()
    }

    /// Checkpoints bound to the given step, with their index in the plan
    pub fn checkpoints_after(&self, id: StepId) -> Vec<(usize, &MemoryCheckpoint)> {
        self.memory_update_points
            .iter()
            .enumerate()
            .filter(|(_, cp)| cp.after_step == id)
            .collect()
    }

    /// Find a dependency cycle, returned as the ids along the cycle
    pub fn find_cycle(&self) -> Option<Vec<StepId>> {
        let edges: BTreeMap<StepId, &[StepId]> = self
            .steps
            .iter()
            .map(|s| (s.id, s.dependencies.as_slice()))
            .collect();

        let mut done: HashSet<StepId> = HashSet::new();
        for &start in edges.keys() {
            if done.contains(&start) {
                continue;
            }
            let mut path: Vec<StepId> = Vec::new();
            if let Some(cycle) = Self::visit(start, &edges, &mut path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        id: StepId,
        edges: &BTreeMap<StepId, &[StepId]>,
        path: &mut Vec<StepId>,
        done: &mut HashSet<StepId>,
    ) -> Option<Vec<StepId>> {
        if let Some(pos) = path.iter().position(|p| *p == id) {
            return Some(path[pos..].to_vec());
        }
        if done.contains(&id) {
            return None;
        }
        path.push(id);
        for dep in edges.get(&id).copied().unwrap_or_default() {
            if let Some(cycle) = Self::visit(*dep, edges, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(id);
        None
    }
}

/// Events emitted while a request is planned and executed
#[derive(Debug, Clone)]
pub enum PlanEvent {
    /// A plan was generated (or loaded) for the request
    PlanCreated {
        request_id: String,
        task_category: String,
        total_steps: usize,
    },
    /// A step was dispatched to its worker
    StepStarted {
        request_id: String,
        step_id: StepId,
        agent: String,
        description: String,
    },
    /// A step was marked completed
    StepCompleted {
        request_id: String,
        step_id: StepId,
        success: bool,
    },
    /// A memory checkpoint ran
    CheckpointFired {
        request_id: String,
        step_id: StepId,
        file_path: String,
        success: bool,
    },
    /// The scheduler finished
    PlanCompleted {
        request_id: String,
        executed_steps: usize,
        truncated: bool,
    },
}
