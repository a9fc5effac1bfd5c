//! Search worker
//!
//! The model picks regex patterns for the step, the project is searched with
//! ripgrep's engine (respecting .gitignore), and the model condenses the
//! matches into an answer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use grep::regex::RegexMatcher;
use grep::searcher::sinks::UTF8;
use grep::searcher::Searcher;
use ignore::WalkBuilder;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::llm::{generate_object, LlmClient, Message};
use crate::orchestrator::context::LineRange;
use crate::orchestrator::{ResourceRecord, Worker, WorkerOutput, WorkerRequest};

use super::worker_messages;

const QUERY_PROMPT: &str = r#"You are the search worker of stepwise, an AI coding assistant.
Choose up to 3 regular expressions (Rust regex syntax) that will find the code or text the step needs.
Prefer identifiers and distinctive phrases over generic words. Optionally restrict the search with a file glob such as "*.rs"."#;

const ANSWER_PROMPT: &str = r#"You are the search worker of stepwise, an AI coding assistant.
Answer the step using the search matches provided. Name files and line numbers. Say so plainly when the matches do not answer the question."#;

#[derive(Debug, Deserialize, JsonSchema)]
struct SearchQuery {
    /// Regular expressions to search for
    patterns: Vec<String>,
    /// Optional file glob, e.g. "*.rs"
    #[serde(default)]
    include: Option<String>,
}

/// One matching line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub path: String,
    pub line: u64,
    pub text: String,
}

/// Search files under `root` for `pattern`, returning at most `limit` matches
pub fn search_files(
    root: &Path,
    pattern: &str,
    include: Option<&str>,
    limit: usize,
) -> Result<Vec<SearchMatch>> {
    let matcher = RegexMatcher::new(pattern)
        .with_context(|| format!("Invalid regex pattern: {}", pattern))?;

    let mut walker_builder = WalkBuilder::new(root);
    walker_builder
        .hidden(false)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .filter_entry(|entry| entry.file_name() != ".git");

    if let Some(include) = include {
        let mut types_builder = ignore::types::TypesBuilder::new();
        types_builder.add("custom", include)?;
        types_builder.select("custom");
        walker_builder.types(types_builder.build()?);
    }

    let mut matches = Vec::new();
    for entry in walker_builder.build().filter_map(|e| e.ok()) {
        if matches.len() >= limit {
            break;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string());

        let mut searcher = Searcher::new();
        let _ = searcher.search_path(
            &matcher,
            path,
            UTF8(|line_num, line| {
                if matches.len() < limit {
                    matches.push(SearchMatch {
                        path: relative.clone(),
                        line: line_num,
                        text: line.trim().to_string(),
                    });
                }
                Ok(matches.len() < limit)
            }),
        );
    }

    Ok(matches)
}

/// Files touched by a set of matches, with the span of matched lines
fn resource_records(matches: &[SearchMatch]) -> Vec<ResourceRecord> {
    let mut spans: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for m in matches {
        let span = spans.entry(&m.path).or_insert((m.line, m.line));
        span.0 = span.0.min(m.line);
        span.1 = span.1.max(m.line);
    }

    let mut records = Vec::new();
    for (path, (start, end)) in spans {
        records.push(ResourceRecord::FileSearched(path.to_string()));
        records.push(ResourceRecord::FileRead {
            path: path.to_string(),
            lines: Some(LineRange {
                start: start as usize,
                end: end as usize,
            }),
        });
    }
    records
}

fn format_matches(pattern_results: &[(String, Vec<SearchMatch>)], limit: usize) -> String {
    let mut text = String::new();
    for (pattern, matches) in pattern_results {
        if matches.is_empty() {
            text.push_str(&format!("No matches found for pattern: {}\n\n", pattern));
            continue;
        }
        text.push_str(&format!("Found {} matches for '{}':\n", matches.len(), pattern));
        for m in matches {
            text.push_str(&format!("{}:{}: {}\n", m.path, m.line, m.text));
        }
        if matches.len() >= limit {
            text.push_str(&format!("(Results truncated at {} matches)\n", limit));
        }
        text.push('\n');
    }
    text
}

pub struct SearchWorker {
    llm: Arc<dyn LlmClient>,
    project_path: PathBuf,
    max_results: usize,
    schema_attempts: usize,
}

impl SearchWorker {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        project_path: PathBuf,
        max_results: usize,
        schema_attempts: usize,
    ) -> Self {
        Self {
            llm,
            project_path,
            max_results,
            schema_attempts,
        }
    }
}

#[async_trait]
impl Worker for SearchWorker {
    fn name(&self) -> &str {
        "search"
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let mut messages = worker_messages(&request)?;

        let query = generate_object::<SearchQuery>(
            self.llm.as_ref(),
            QUERY_PROMPT,
            &messages,
            "choose_search",
            "Choose the patterns to search the project for",
            self.schema_attempts,
        )
        .await?;
        let mut usage = query.usage.clone();

        let mut pattern_results = Vec::new();
        let mut all_matches = Vec::new();
        for pattern in query.value.patterns.iter().take(3) {
            let root = self.project_path.clone();
            let owned_pattern = pattern.clone();
            let include = query.value.include.clone();
            let limit = self.max_results;

            tracing::debug!("Searching for '{}' in {}", pattern, root.display());
            let result = tokio::task::spawn_blocking(move || {
                search_files(&root, &owned_pattern, include.as_deref(), limit)
            })
            .await
            .context("Search task panicked")?;

            match result {
                Ok(matches) => {
                    all_matches.extend(matches.iter().cloned());
                    pattern_results.push((pattern.clone(), matches));
                }
                Err(e) => {
                    tracing::warn!("Skipping search pattern: {:#}", e);
                    pattern_results.push((format!("{} (invalid: {})", pattern, e), Vec::new()));
                }
            }
        }

        messages.push(Message::user(format!(
            "Search results:\n\n{}",
            format_matches(&pattern_results, self.max_results)
        )));
        let response = self
            .llm
            .send_message_with_system(&messages, &[], Some(ANSWER_PROMPT))
            .await?;
        let answer = response.text();
        usage.accumulate(&response.usage.unwrap_or_default());

        Ok(WorkerOutput::text(answer.trim())
            .with_records(resource_records(&all_matches))
            .with_usage(usage, self.llm.model()))
    }
}
