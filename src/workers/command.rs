//! Command worker
//!
//! The model proposes one shell command for the step. Commands matching a
//! dangerous pattern are refused; everything else runs in the project
//! directory under a timeout with its output truncated.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::ToolConfig;
use crate::llm::{generate_object, LlmClient};
use crate::orchestrator::context::CommandRecord;
use crate::orchestrator::{ResourceRecord, Worker, WorkerOutput, WorkerRequest};

use super::worker_messages;

const PROPOSAL_PROMPT: &str = r#"You are the command worker of stepwise, an AI coding assistant.
Propose exactly one non-interactive shell command (sh syntax) that performs the step in the project directory.
Prefer read-only and idempotent commands. Never propose destructive commands."#;

#[derive(Debug, Deserialize, JsonSchema)]
struct CommandProposal {
    /// The shell command to run
    command: String,
    /// Why this command performs the step
    #[serde(default)]
    reason: String,
    /// Timeout in seconds, if the default is too short
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// Outcome of running a command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRun {
    pub output: String,
    /// `None` when the command was killed after timing out
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Patterns among `patterns` that match `command`
pub fn dangerous_matches(command: &str, patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(command))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Truncate output on a character boundary, noting how much was dropped
pub fn truncate_output(output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }

    let mut safe_end = max_bytes;
    while safe_end > 0 && !output.is_char_boundary(safe_end) {
        safe_end -= 1;
    }

    let mut result = output[..safe_end].to_string();
    result.push_str(&format!(
        "\n\n[OUTPUT TRUNCATED: {} bytes omitted. Total output was {} bytes, limit is {} bytes]",
        output.len() - safe_end,
        output.len(),
        max_bytes
    ));
    result
}

/// Run `command` with `sh -c` in `working_dir`
pub async fn run_command(
    command: &str,
    working_dir: &Path,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<CommandRun> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("Failed to spawn command")?;

    let mut stdout = child.stdout.take().context("Failed to capture stdout")?;
    let mut stderr = child.stderr.take().context("Failed to capture stderr")?;

    let result = tokio::time::timeout(timeout, async {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let (stdout_result, stderr_result) = tokio::join!(
            tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut stdout_buf),
            tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut stderr_buf)
        );
        stdout_result.context("Failed to read stdout")?;
        stderr_result.context("Failed to read stderr")?;

        let status = child.wait().await.context("Failed to wait for process")?;
        Ok::<_, anyhow::Error>((stdout_buf, stderr_buf, status))
    })
    .await;

    match result {
        Ok(Ok((stdout_buf, stderr_buf, status))) => {
            let mut output = String::from_utf8_lossy(&stdout_buf).to_string();
            let stderr_str = String::from_utf8_lossy(&stderr_buf);
            if !stderr_str.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&stderr_str);
            }

            Ok(CommandRun {
                output: truncate_output(output, max_output_bytes),
                exit_code: status.code(),
                timed_out: false,
            })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            tracing::warn!(
                "Command timed out after {}s, killing process: {}",
                timeout.as_secs(),
                command
            );
            if let Err(kill_err) = child.kill().await {
                tracing::error!("Failed to kill timed-out process: {}", kill_err);
            }
            Ok(CommandRun {
                output: format!(
                    "The command exceeded the timeout of {} seconds and was terminated.",
                    timeout.as_secs()
                ),
                exit_code: None,
                timed_out: true,
            })
        }
    }
}

pub struct CommandWorker {
    llm: Arc<dyn LlmClient>,
    project_path: PathBuf,
    config: ToolConfig,
    schema_attempts: usize,
}

impl CommandWorker {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        project_path: PathBuf,
        config: ToolConfig,
        schema_attempts: usize,
    ) -> Self {
        Self {
            llm,
            project_path,
            config,
            schema_attempts,
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerOutput> {
        let messages = worker_messages(&request)?;
        let proposal = generate_object::<CommandProposal>(
            self.llm.as_ref(),
            PROPOSAL_PROMPT,
            &messages,
            "propose_command",
            "Propose the shell command that performs this step",
            self.schema_attempts,
        )
        .await?;
        let command = proposal.value.command.trim().to_string();
        if command.is_empty() {
            bail!("No command was proposed for this step");
        }

        if self.config.warn_dangerous_commands {
            let matched = dangerous_matches(&command, &self.config.dangerous_patterns);
            if !matched.is_empty() {
                bail!(
                    "Refused to run '{}': it matches dangerous pattern(s) {}",
                    command,
                    matched.join(", ")
                );
            }
        }

        let timeout_secs = proposal
            .value
            .timeout_secs
            .unwrap_or(self.config.bash_timeout_secs)
            .min(self.config.bash_timeout_secs.max(1) * 5);
        tracing::debug!(
            "Running command with {}s timeout: {} ({})",
            timeout_secs,
            command,
            proposal.value.reason
        );

        let run = run_command(
            &command,
            &self.project_path,
            Duration::from_secs(timeout_secs),
            self.config.max_output_bytes,
        )
        .await?;

        let status = match (run.timed_out, run.exit_code) {
            (true, _) => "timed out".to_string(),
            (false, Some(code)) => format!("exit code {}", code),
            (false, None) => "terminated by signal".to_string(),
        };
        let value = format!("$ {}\n{}\n[{}]", command, run.output.trim_end(), status);

        Ok(WorkerOutput::text(value)
            .with_records(vec![ResourceRecord::Command(CommandRecord {
                command,
                result: run.output,
                exit_code: run.exit_code,
            })])
            .with_usage(proposal.usage, proposal.model))
    }
}
