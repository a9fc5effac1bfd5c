use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: usize,
    /// Base URL for API (optional, for proxies or compatible endpoints)
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Anthropic,
    OpenAI,
}

/// Limits and knobs for plan scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of steps executed for one plan (default: 20)
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// How many times a fully blocked plan gets its first step unblocked (default: 1)
    #[serde(default = "default_deadlock_repair_attempts")]
    pub deadlock_repair_attempts: usize,

    /// Resource log entries carried in a worker's summarized context (default: 3)
    #[serde(default = "default_context_recent_entries")]
    pub context_recent_entries: usize,

    /// Attempts at producing a schema-conforming plan (default: 2)
    #[serde(default = "default_schema_attempts")]
    pub schema_attempts: usize,

    /// User identifier stamped on each request context
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

fn default_max_steps() -> usize {
    20
}

fn default_deadlock_repair_attempts() -> usize {
    1
}

fn default_context_recent_entries() -> usize {
    3
}

fn default_schema_attempts() -> usize {
    2
}

fn default_user_id() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            deadlock_repair_attempts: default_deadlock_repair_attempts(),
            context_recent_entries: default_context_recent_entries(),
            schema_attempts: default_schema_attempts(),
            user_id: default_user_id(),
        }
    }
}

/// Backoff settings for rate-limited generation calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed delay (0.0 - 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Configuration for the command and search workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Default timeout for shell commands in seconds (default: 120)
    #[serde(default = "default_bash_timeout")]
    pub bash_timeout_secs: u64,

    /// Maximum output size in bytes before truncation (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Refuse commands matching `dangerous_patterns` (default: true)
    #[serde(default = "default_true")]
    pub warn_dangerous_commands: bool,

    /// List of command patterns to refuse (regexes)
    #[serde(default = "default_dangerous_patterns")]
    pub dangerous_patterns: Vec<String>,

    /// Maximum matching lines returned by one search (default: 50)
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,
}

fn default_bash_timeout() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    1_048_576 // 1MB
}

fn default_search_max_results() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_dangerous_patterns() -> Vec<String> {
    vec![
        r"rm\s+-rf\s+/".to_string(),
        r"rm\s+-rf\s+~".to_string(),
        r":\(\)\s*\{\s*:\|:&\s*\}".to_string(), // Fork bomb
        r"dd\s+if=.*of=/dev/".to_string(),
        r"mkfs\.".to_string(),
        r">\s*/dev/sd".to_string(),
        r"chmod\s+-R\s+777\s+/".to_string(),
    ]
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            bash_timeout_secs: default_bash_timeout(),
            max_output_bytes: default_max_output_bytes(),
            warn_dangerous_commands: true,
            dangerous_patterns: default_dangerous_patterns(),
            search_max_results: default_search_max_results(),
        }
    }
}

/// Location of the project knowledge store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory relative to the project root (default: .stepwise/memory)
    #[serde(default = "default_memory_directory")]
    pub directory: PathBuf,
}

fn default_memory_directory() -> PathBuf {
    PathBuf::from(".stepwise").join("memory")
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            directory: default_memory_directory(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir.join("stepwise").join("config.toml"))
    }
}

impl Default for Config {
    fn default() -> Self {
        // Try to detect provider from environment variables
        let (provider, api_key, model) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            (
                LlmProvider::Anthropic,
                Some(key),
                "claude-sonnet-4-20250514".to_string(),
            )
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            (LlmProvider::OpenAI, Some(key), "gpt-4o".to_string())
        } else {
            (
                LlmProvider::Anthropic,
                None,
                "claude-sonnet-4-20250514".to_string(),
            )
        };

        Self {
            llm: LlmConfig {
                provider,
                api_key,
                model,
                max_tokens: 8192,
                base_url: None,
            },
            orchestrator: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            tools: ToolConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}
