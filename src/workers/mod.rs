//! Worker implementations
//!
//! One worker per `WorkerRole`. Every worker receives the summarized context
//! snapshot embedded in its message set and reports the tokens it spent.

pub mod command;
pub mod memory;
pub mod prompted;
pub mod search;

pub use command::CommandWorker;
pub use memory::MemoryWorker;
pub use prompted::PromptedWorker;
pub use search::SearchWorker;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::llm::{LlmClient, Message};
use crate::memory::KnowledgeStore;
use crate::orchestrator::propagation::embed_context;
use crate::orchestrator::{CapabilityRegistry, WorkerRequest, WorkerRole};

/// Registry with the built-in worker for every role
pub fn default_registry(
    llm: Arc<dyn LlmClient>,
    config: &Config,
    project_path: &Path,
) -> CapabilityRegistry {
    let store = KnowledgeStore::new(project_path, &config.memory.directory);
    let attempts = config.orchestrator.schema_attempts;

    CapabilityRegistry::new()
        .with_worker(
            WorkerRole::Search,
            Arc::new(SearchWorker::new(
                llm.clone(),
                project_path.to_path_buf(),
                config.tools.search_max_results,
                attempts,
            )),
        )
        .with_worker(
            WorkerRole::Command,
            Arc::new(CommandWorker::new(
                llm.clone(),
                project_path.to_path_buf(),
                config.tools.clone(),
                attempts,
            )),
        )
        .with_worker(
            WorkerRole::Memory,
            Arc::new(MemoryWorker::new(llm.clone(), store, attempts)),
        )
        .with_worker(
            WorkerRole::Verification,
            Arc::new(PromptedWorker::verification(llm.clone())),
        )
        .with_worker(WorkerRole::UserIntent, Arc::new(PromptedWorker::user_intent(llm)))
}

/// Message set for a worker call: the context snapshot, then the request
pub(crate) fn worker_messages(request: &WorkerRequest) -> Result<Vec<Message>> {
    let mut text = request.prompt.clone();
    if let Some(additional) = &request.additional_context {
        text.push_str("\n\n");
        text.push_str(additional);
    }

    let mut messages = vec![Message::user(text)];
    if let Some(summary) = &request.context {
        embed_context(&mut messages, summary)?;
    }
    Ok(messages)
}
