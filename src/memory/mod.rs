use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;

/// Name of the file created by `init`
pub const INDEX_FILE: &str = "INDEX.md";

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("Knowledge file path must be relative and stay inside the store: '{0}'")]
    InvalidPath(String),
}

/// Project knowledge kept as markdown files under the memory directory
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    root: PathBuf,
}

impl KnowledgeStore {
    /// Store rooted at `directory`, resolved against the project path when relative
    pub fn new(project_path: &Path, directory: &Path) -> Self {
        let root = if directory.is_absolute() {
            directory.to_path_buf()
        } else {
            project_path.join(directory)
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a store-relative path onto the filesystem, refusing escapes
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let trimmed = relative.trim();
        let path = Path::new(trimmed);
        let valid = !trimmed.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(KnowledgeError::InvalidPath(relative.to_string()).into());
        }
        Ok(self.root.join(path))
    }

    /// All files in the store, relative to its root, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to read {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    files.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Contents of a knowledge file, `None` when it does not exist
    pub async fn read(&self, relative: &str) -> Result<Option<String>> {
        let path = self.resolve(relative)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read knowledge file {}", relative))?;
        Ok(Some(content))
    }

    /// Replace a knowledge file; returns true when the file was created
    pub async fn write(&self, relative: &str, content: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        let created = !fs::try_exists(&path).await.unwrap_or(false);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write knowledge file {}", relative))?;
        Ok(created)
    }

    /// Add a section to the end of a knowledge file, creating it if needed
    pub async fn append(&self, relative: &str, content: &str) -> Result<bool> {
        let existing = self.read(relative).await?.unwrap_or_default();
        let combined = if existing.trim().is_empty() {
            content.to_string()
        } else {
            format!("{}\n\n{}", existing.trim_end(), content)
        };
        self.write(relative, &combined).await
    }

    /// Create the store with a default index; false if the index already exists
    pub async fn init(&self) -> Result<bool> {
        fs::create_dir_all(&self.root).await?;
        if self.read(INDEX_FILE).await?.is_some() {
            return Ok(false);
        }

        let default_content = r#"# Project Knowledge

Notes stepwise keeps about this project. Workers read these files before
planning and update them at memory checkpoints.

## Architecture

[Describe the main components and how they fit together]

## Conventions

[Coding standards, naming, testing practices]

## Decisions

[Important decisions and their context]
"#;
        self.write(INDEX_FILE, default_content).await?;
        Ok(true)
    }

    /// Human-readable list of knowledge files with their sizes
    pub async fn inventory(&self) -> Result<String> {
        let files = self.list().await?;
        if files.is_empty() {
            return Ok("No project knowledge files exist yet.".to_string());
        }

        let mut output = String::from("Project knowledge files:\n");
        for file in files {
            let size = fs::metadata(self.root.join(&file))
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            output.push_str(&format!("- {} ({} bytes)\n", file, size));
        }
        Ok(output)
    }
}
