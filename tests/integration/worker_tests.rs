use super::common::*;
use anyhow::Result;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use serde_json::json;
use std::sync::Arc;

use stepwise::config::Config;
use stepwise::orchestrator::context::CommandRecord;
use stepwise::orchestrator::{ResourceRecord, StepOutput, WorkerRequest, WorkerRole};
use stepwise::memory::KnowledgeStore;
use stepwise::project::{AmbientContext, WorkspaceContext};
use stepwise::workers::default_registry;

/// A small Rust project with a config loader and a README
fn project() -> Result<TempDir> {
    let temp = TempDir::new()?;
    temp.child("Cargo.toml").write_str(
        r#"[package]
name = "demo"
version = "0.1.0"
edition = "2021"
"#,
    )?;
    temp.child("src/lib.rs").write_str(
        "pub fn load_config() -> String {\n    String::new()\n}\n",
    )?;
    temp.child("README.md")
        .write_str("# Demo\n\nLoads configuration.\n")?;
    Ok(temp)
}

fn config() -> Config {
    let mut config = Config::default();
    config.orchestrator.schema_attempts = 1;
    config.tools.bash_timeout_secs = 10;
    config
}

#[tokio::test]
async fn test_command_worker_runs_in_project() -> Result<()> {
    let temp = project()?;
    let llm = Arc::new(ScriptedLlm::new(
        json!({"command": "ls src", "reason": "list sources"}),
    ));
    let registry = default_registry(llm.clone(), &config(), temp.path());

    let output = registry
        .resolve(WorkerRole::Command)?
        .execute(WorkerRequest::new("list the source files"))
        .await?;

    assert_eq!(
        output.value,
        StepOutput::from("$ ls src\nlib.rs\n[exit code 0]")
    );
    assert_eq!(
        output.records,
        vec![ResourceRecord::Command(CommandRecord {
            command: "ls src".to_string(),
            result: "lib.rs\n".to_string(),
            exit_code: Some(0),
        })]
    );
    assert_eq!(output.usage.unwrap().model, "scripted-model");
    Ok(())
}

#[tokio::test]
async fn test_command_worker_refuses_dangerous_commands() -> Result<()> {
    let temp = project()?;
    let llm = Arc::new(ScriptedLlm::new(json!({"command": "rm -rf /"})));
    let registry = default_registry(llm, &config(), temp.path());

    let err = registry
        .resolve(WorkerRole::Command)?
        .execute(WorkerRequest::new("clean up"))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Refused to run 'rm -rf /'"));
    assert!(temp.child("Cargo.toml").path().exists());
    Ok(())
}

#[tokio::test]
async fn test_search_worker_finds_and_condenses() -> Result<()> {
    let temp = project()?;
    let llm = Arc::new(ScriptedLlm::new(
        json!({"patterns": ["fn load_config"], "include": "*.rs"}),
    ));
    let registry = default_registry(llm.clone(), &config(), temp.path());

    let output = registry
        .resolve(WorkerRole::Search)?
        .execute(WorkerRequest::new("find where config is loaded"))
        .await?;

    assert_eq!(output.value, StepOutput::from("scripted answer"));
    assert!(output
        .records
        .contains(&ResourceRecord::FileSearched("src/lib.rs".to_string())));

    let calls = llm.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    let results = calls[1].last().unwrap().text();
    assert!(results.contains("src/lib.rs:1: pub fn load_config() -> String {"));

    let usage = output.usage.unwrap().usage;
    assert_eq!(usage.input_tokens, 200);
    Ok(())
}

#[tokio::test]
async fn test_memory_worker_writes_into_store() -> Result<()> {
    let temp = project()?;
    let llm = Arc::new(ScriptedLlm::new(json!({
        "action": "write",
        "filePath": "architecture.md",
        "content": "# Architecture\n\nConfig is loaded in src/lib.rs"
    })));
    let config = config();
    let registry = default_registry(llm, &config, temp.path());

    let output = registry
        .resolve(WorkerRole::Memory)?
        .execute(WorkerRequest::new("Update the knowledge file `architecture.md`."))
        .await?;

    assert_eq!(
        output.records,
        vec![ResourceRecord::MemoryCreated("architecture.md".to_string())]
    );
    let store = KnowledgeStore::new(temp.path(), &config.memory.directory);
    let content = store.read("architecture.md").await?.unwrap();
    assert!(content.contains("src/lib.rs"));
    Ok(())
}

#[tokio::test]
async fn test_prompted_workers_answer_with_text() -> Result<()> {
    let temp = project()?;
    let llm = Arc::new(ScriptedLlm::new(json!({})));
    let registry = default_registry(llm, &config(), temp.path());

    for role in [WorkerRole::Verification, WorkerRole::UserIntent] {
        let output = registry
            .resolve(role)?
            .execute(WorkerRequest::new("check it").with_additional_context("details"))
            .await?;
        assert_eq!(output.value, StepOutput::from("scripted answer"));
    }
    Ok(())
}

#[tokio::test]
async fn test_workspace_context_describes_project() -> Result<()> {
    let temp = project()?;
    let config = config();
    let store = KnowledgeStore::new(temp.path(), &config.memory.directory);
    store.init().await?;
    let ambient = WorkspaceContext::new(temp.path().to_path_buf(), store);

    let project = ambient.project_context().await?.text();
    assert!(project.contains("Detected: Rust (Cargo.toml)"));
    assert!(project.contains("- src/"));
    assert!(project.contains("# Demo"));
    assert!(!project.contains(".stepwise"));

    let memory = ambient.memory_files_context().await?.text();
    assert!(memory.contains("- INDEX.md ("));
    Ok(())
}
