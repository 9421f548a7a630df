//! Configuration types for termpal

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TermpalError;

/// Main configuration struct for termpal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent loop settings (model options, budgets, depth, prompt)
    pub agent: AgentConfig,
    /// Model backend selection and credentials
    pub backend: BackendConfig,
    /// Retry policy for transient backend errors
    pub retry: RetryConfig,
    /// Tool execution settings (confirmation gate, workspace, environment)
    pub tools: ToolsConfig,
    /// Conversation log storage
    pub storage: StorageConfig,
    /// Retrieval augmentation
    pub retrieval: RetrievalConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

// ============================================================================
// Agent
// ============================================================================

/// Settings for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier passed to the backend; empty means the backend default
    pub model: String,
    /// Maximum tokens the model may generate per response
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Token budget for the context window sent with each request
    pub context_budget: usize,
    /// Maximum tool-execution rounds within one turn
    pub max_tool_depth: usize,
    /// Wall-clock timeout for a single tool execution
    pub tool_timeout_secs: u64,
    /// Base system prompt; the tool list is appended to it
    pub system_prompt: String,
    /// Treat fenced ```bash / ```python blocks as tool calls when the model
    /// emits no structured tool calls
    pub codeblock_tools: bool,
    /// Summarize history that falls outside the context budget
    pub summarize_dropped: bool,
}

/// Default system prompt text.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are termpal, a helpful assistant running in the user's terminal. \
You can use tools to inspect and change the user's workspace. \
Prefer small, verifiable steps and report what you did.";

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 4096,
            temperature: 0.7,
            context_budget: 16_000,
            max_tool_depth: 8,
            tool_timeout_secs: 60,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            codeblock_tools: false,
            summarize_dropped: true,
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Which backend variant serves the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Remote OpenAI-compatible chat completions endpoint
    #[default]
    Remote,
    /// Locally served model (Ollama-style `/api/chat`)
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => write!(f, "remote"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = TermpalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" => Ok(BackendKind::Remote),
            "local" => Ok(BackendKind::Local),
            other => Err(TermpalError::Config(format!(
                "unknown backend kind '{}' (expected 'remote' or 'local')",
                other
            ))),
        }
    }
}

/// Backend connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend variant
    pub kind: BackendKind,
    /// API key (remote only)
    pub api_key: Option<String>,
    /// Custom API base URL
    pub api_base: Option<String>,
    /// Seconds a backend may stay silent before the request times out
    pub request_timeout_secs: Option<u64>,
}

/// Retry behavior for backend calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable automatic retry for transient backend errors.
    pub enabled: bool,
    /// Maximum number of retry attempts after the first one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

// ============================================================================
// Tools
// ============================================================================

/// Policy of the confirmation gate for destructive tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationPolicy {
    /// Run destructive tools without asking
    AutoApprove,
    /// Ask the user before every destructive tool call
    #[default]
    PromptEachTime,
    /// Refuse every destructive tool call
    DenyAll,
}

impl fmt::Display for ConfirmationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationPolicy::AutoApprove => write!(f, "auto-approve"),
            ConfirmationPolicy::PromptEachTime => write!(f, "prompt-each-time"),
            ConfirmationPolicy::DenyAll => write!(f, "deny-all"),
        }
    }
}

impl FromStr for ConfirmationPolicy {
    type Err = TermpalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "auto-approve" | "auto" => Ok(ConfirmationPolicy::AutoApprove),
            "prompt-each-time" | "prompt" => Ok(ConfirmationPolicy::PromptEachTime),
            "deny-all" | "deny" => Ok(ConfirmationPolicy::DenyAll),
            other => Err(TermpalError::Config(format!(
                "invalid confirmation policy '{}' (expected auto-approve, prompt-each-time or deny-all)",
                other
            ))),
        }
    }
}

/// Tool execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Confirmation gate policy for destructive tools
    pub confirmation: ConfirmationPolicy,
    /// Workspace directory; file tools are confined to it and processes run in it
    pub workspace: String,
    /// Environment variables passed through to child processes
    pub env_allowlist: Vec<String>,
    /// Captured output is clipped to this many characters
    pub max_output_chars: usize,
    /// Interpreter used by the python tool
    pub python_bin: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            confirmation: ConfirmationPolicy::default(),
            workspace: ".".to_string(),
            env_allowlist: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "LANG".to_string(),
                "TERM".to_string(),
                "USER".to_string(),
            ],
            max_output_chars: 16_000,
            python_bin: "python3".to_string(),
        }
    }
}

// ============================================================================
// Storage & retrieval
// ============================================================================

/// Conversation log storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one `.jsonl` log per conversation
    pub dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: "~/.termpal/conversations".to_string(),
        }
    }
}

/// Which side wins when retrieval snippets and recent history compete for
/// the same token budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPrecedence {
    /// Fill the budget with recent history, then add snippets that still fit
    #[default]
    HistoryFirst,
    /// Place snippets first, then fill the rest with recent history
    RetrievalFirst,
}

impl FromStr for RetrievalPrecedence {
    type Err = TermpalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "history_first" => Ok(RetrievalPrecedence::HistoryFirst),
            "retrieval_first" => Ok(RetrievalPrecedence::RetrievalFirst),
            other => Err(TermpalError::Config(format!(
                "invalid retrieval precedence '{}'",
                other
            ))),
        }
    }
}

/// Retrieval augmentation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Query the document index on every user turn
    pub enabled: bool,
    /// Number of snippets requested per query
    pub top_k: usize,
    /// Snippets scoring below this are discarded
    pub min_score: f32,
    /// Budget precedence between snippets and history
    pub precedence: RetrievalPrecedence,
    /// Directory of text documents to index; defaults to the workspace
    pub docs_dir: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: 3,
            min_score: 0.1,
            precedence: RetrievalPrecedence::default(),
            docs_dir: None,
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Pretty,
    /// Structured JSON lines
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Default filter level when `RUST_LOG` is unset
    pub level: String,
    /// Append logs to this file instead of stderr
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "warn".to_string(),
            file: None,
        }
    }
}
