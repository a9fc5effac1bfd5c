//! Worker roles and role repair

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::OrchestratorError;

/// The five kinds of worker a plan step can be assigned to
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum WorkerRole {
    /// Finds code, files and facts in the project
    Search,
    /// Reads and writes the project knowledge store
    Memory,
    /// Runs shell commands
    Command,
    /// Checks results against expectations and condenses answers
    Verification,
    /// Works out what the user actually asked for
    UserIntent,
}

/// Keyword vocabulary per role, in repair precedence order
const REPAIR_VOCABULARY: &[(WorkerRole, &[&str])] = &[
    (
        WorkerRole::Search,
        &["search", "find", "locate", "look", "grep", "explore", "inspect", "read"],
    ),
    (
        WorkerRole::Memory,
        &["memory", "document", "note", "record", "remember", "knowledge"],
    ),
    (
        WorkerRole::Command,
        &["run", "execute", "build", "compile", "install", "command", "shell"],
    ),
    (
        WorkerRole::Verification,
        &["verify", "validate", "check", "confirm", "review", "ensure"],
    ),
    (
        WorkerRole::UserIntent,
        &["intent", "clarify", "interpret", "understand", "ambigu"],
    ),
];

impl WorkerRole {
    pub const ALL: [WorkerRole; 5] = [
        WorkerRole::Search,
        WorkerRole::Memory,
        WorkerRole::Command,
        WorkerRole::Verification,
        WorkerRole::UserIntent,
    ];

    /// Wire name used in plans and prompts
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Search => "search",
            WorkerRole::Memory => "memory",
            WorkerRole::Command => "command",
            WorkerRole::Verification => "verification",
            WorkerRole::UserIntent => "userIntent",
        }
    }

    /// When the planner should pick this role
    pub fn selection_criteria(&self) -> &'static str {
        match self {
            WorkerRole::Search => {
                "locate files, symbols, usages or facts in the codebase; read code before changing it"
            }
            WorkerRole::Memory => {
                "read or update project knowledge notes (architecture, conventions, decisions)"
            }
            WorkerRole::Command => {
                "run a shell command: build, test, lint, inspect git state, install dependencies"
            }
            WorkerRole::Verification => {
                "check earlier results for correctness and completeness, compare against expectations"
            }
            WorkerRole::UserIntent => {
                "analyse an ambiguous request and state precisely what the user wants"
            }
        }
    }

    /// Exact (case-insensitive) parse of a role name
    pub fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        Self::ALL
            .into_iter()
            .find(|role| role.as_str().to_lowercase() == normalized)
    }

    /// Best-effort role guess from a step description.
    ///
    /// Roles are tried in the order search, memory, command, verification,
    /// userIntent; the first role with a keyword that prefixes a word of the
    /// description wins. Falls back to `Search`.
    pub fn infer_from_description(description: &str) -> Self {
        let lowered = description.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        REPAIR_VOCABULARY
            .iter()
            .find(|(_, keywords)| {
                words
                    .iter()
                    .any(|word| keywords.iter().any(|kw| word.starts_with(kw)))
            })
            .map(|(role, _)| *role)
            .unwrap_or(WorkerRole::Search)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| OrchestratorError::InvalidRole(s.to_string()))
    }
}
