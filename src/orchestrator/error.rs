use thiserror::Error;

use super::role::WorkerRole;

/// Typed orchestration failures.
///
/// Only `PlanGeneration` ever reaches the caller of `create_plan`; the others
/// are turned into step results or context error entries by the scheduler.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Failed to generate a plan: {0}")]
    PlanGeneration(String),

    #[error("Invalid worker role '{0}'")]
    InvalidRole(String),

    #[error("No worker registered for role '{0}'")]
    WorkerNotRegistered(WorkerRole),

    #[error("Dependency deadlock: no step can run (pending steps: {pending:?})")]
    Deadlock { pending: Vec<u32> },
}
