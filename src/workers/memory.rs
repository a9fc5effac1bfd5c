//! Memory worker
//!
//! Reads and updates the project knowledge store. The model sees the store's
//! inventory (and the current content of a file it is asked to update) and
//! chooses one edit, which is applied here.

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::Arc;

use crate::llm::{generate_object, LlmClient, Message, TokenUsage};
use crate::memory::KnowledgeStore;
use crate::orchestrator::{ResourceRecord, Worker, WorkerOutput, WorkerRequest};

use super::worker_messages;

const MEMORY_PROMPT: &str = r#"You are the memory worker of stepwise, an AI coding assistant.
You maintain markdown knowledge files about the project (architecture, conventions, decisions).
Choose one action:
- "read" to return the content of an existing file,
- "append" to add a new section to a file,
- "write" to replace a file with a complete, updated version.
File paths are relative to the knowledge store. Keep notes factual and concise; do not duplicate what a file already says."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum MemoryAction {
    Read,
    Append,
    Write,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct MemoryEdit {
    action: MemoryAction,
    /// Knowledge file, relative to the store (e.g. "architecture.md")
    file_path: String,
    /// New content for append/write
    #[serde(default)]
    content: Option<String>,
}

pub struct MemoryWorker {
    llm: Arc<dyn LlmClient>,
    store: KnowledgeStore,
    schema_attempts: usize,
}

impl MemoryWorker {
    pub fn new(llm: Arc<dyn LlmClient>, store: KnowledgeStore, schema_attempts: usize) -> Self {
        Self {
            llm,
            store,
            schema_attempts,
        }
    }

    /// Inventory plus the content of every known file the request mentions
    async fn store_overview(&self, request: &WorkerRequest) -> Result<String> {
        let mut overview = self.store.inventory().await?;
        for file in self.store.list().await? {
            if !request.prompt.contains(&file) {
                continue;
            }
            if let Some(content) = self.store.read(&file).await? {
                overview.push_str(&format!("\nCurrent content of {}:\n{}\n", file, content));
            }
        }
        Ok(overview)
    }
}

#[async_trait]
impl Worker for MemoryWorker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let mut messages = worker_messages(&request)?;
        messages.push(Message::user(self.store_overview(&request).await?));

        let edit = generate_object::<MemoryEdit>(
            self.llm.as_ref(),
            MEMORY_PROMPT,
            &messages,
            "edit_memory",
            "Read or update one project knowledge file",
            self.schema_attempts,
        )
        .await?;
        let usage: TokenUsage = edit.usage;
        let file_path = edit.value.file_path.trim().to_string();

        let output = match (edit.value.action, edit.value.content) {
            (MemoryAction::Read, _) => match self.store.read(&file_path).await? {
                Some(content) => WorkerOutput::text(content)
                    .with_records(vec![ResourceRecord::MemoryRead(file_path)]),
                None => WorkerOutput::text(format!("Knowledge file {} does not exist.", file_path)),
            },
            (MemoryAction::Append, Some(content)) => {
                self.store.append(&file_path, &content).await?;
                tracing::info!("Appended to knowledge file {}", file_path);
                WorkerOutput::text(format!("Appended to {}:\n{}", file_path, content))
                    .with_records(vec![ResourceRecord::MemoryCreated(file_path)])
            }
            (MemoryAction::Write, Some(content)) => {
                let created = self.store.write(&file_path, &content).await?;
                tracing::info!("Wrote knowledge file {}", file_path);
                let verb = if created { "Created" } else { "Updated" };
                WorkerOutput::text(format!("{} {}:\n{}", verb, file_path, content))
                    .with_records(vec![ResourceRecord::MemoryCreated(file_path)])
            }
            (action, None) => {
                anyhow::bail!("Memory {:?} of {} carried no content", action, file_path)
            }
        };

        Ok(output.with_usage(usage, edit.model))
    }
}
