//! Ambient project context
//!
//! The planner sees a short description of the project and the current
//! knowledge inventory before it plans. Both come from an `AmbientContext`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::llm::Message;
use crate::memory::KnowledgeStore;

/// Manifest files that identify the project's ecosystem
const PROJECT_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "Rust"),
    ("package.json", "Node.js"),
    ("tsconfig.json", "TypeScript"),
    ("go.mod", "Go"),
    ("pyproject.toml", "Python"),
    ("setup.py", "Python (legacy)"),
    ("CMakeLists.txt", "C/C++ (CMake)"),
    ("build.gradle", "JVM (Gradle)"),
    ("build.gradle.kts", "JVM (Gradle)"),
    ("pom.xml", "JVM (Maven)"),
];

const README_CANDIDATES: &[&str] = &["README.md", "README", "readme.md", "README.txt"];
const README_HEAD_LINES: usize = 20;
const MAX_TOP_LEVEL_ENTRIES: usize = 40;

/// Fetches ambient context messages for plan generation
#[async_trait]
pub trait AmbientContext: Send + Sync {
    /// Summary of the project the assistant works in
    async fn project_context(&self) -> Result<Message>;

    /// Inventory of the project's knowledge files
    async fn memory_files_context(&self) -> Result<Message>;
}

/// Ambient context read from a project directory on disk
pub struct WorkspaceContext {
    project_path: PathBuf,
    store: KnowledgeStore,
}

impl WorkspaceContext {
    pub fn new(project_path: PathBuf, store: KnowledgeStore) -> Self {
        Self {
            project_path,
            store,
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    fn detected_ecosystems(&self) -> Vec<String> {
        PROJECT_MARKERS
            .iter()
            .filter(|(marker, _)| self.project_path.join(marker).exists())
            .map(|(marker, kind)| format!("{} ({})", kind, marker))
            .collect()
    }

    async fn top_level_entries(&self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.project_path)
            .await
            .with_context(|| format!("Failed to list {}", self.project_path.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                entries.push(format!("{}/", name));
            } else {
                entries.push(name);
            }
        }
        entries.sort();
        entries.truncate(MAX_TOP_LEVEL_ENTRIES);
        Ok(entries)
    }

    async fn readme_head(&self) -> Option<String> {
        for candidate in README_CANDIDATES {
            let path = self.project_path.join(candidate);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                let head: Vec<&str> = content.lines().take(README_HEAD_LINES).collect();
                return Some(head.join("\n"));
            }
        }
        None
    }
}

#[async_trait]
impl AmbientContext for WorkspaceContext {
    async fn project_context(&self) -> Result<Message> {
        let name = self
            .project_path
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| self.project_path.display().to_string());

        let mut text = format!("Project: {}\n", name);

        let ecosystems = self.detected_ecosystems();
        if !ecosystems.is_empty() {
            text.push_str(&format!("Detected: {}\n", ecosystems.join(", ")));
        }

        let entries = self.top_level_entries().await?;
        if !entries.is_empty() {
            text.push_str("\nTop-level entries:\n");
            for entry in entries {
                text.push_str(&format!("- {}\n", entry));
            }
        }

        if let Some(readme) = self.readme_head().await {
            text.push_str("\nREADME (beginning):\n");
            text.push_str(&readme);
            text.push('\n');
        }

        Ok(Message::user(text))
    }

    async fn memory_files_context(&self) -> Result<Message> {
        let inventory = self.store.inventory().await?;
        Ok(Message::user(inventory))
    }
}
