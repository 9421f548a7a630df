//! Tool types for termpal
//!
//! This module defines the core types for tool execution, including the `Tool`
//! trait that all tools implement and the `ToolContext` struct that carries
//! execution context (workspace, environment, cancellation, output capture).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TermpalError};

/// Category of a tool, used to decide whether it needs confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Reads files without modifying anything
    FilesystemRead,
    /// Creates or modifies files
    FilesystemWrite,
    /// Runs shell commands
    Shell,
    /// Runs interpreted code
    CodeExecution,
    /// Queries an index or search collaborator
    Search,
    /// Pure computation with no side effects
    General,
}

impl ToolCategory {
    /// Whether tools of this category can change state outside the conversation.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ToolCategory::FilesystemWrite | ToolCategory::Shell | ToolCategory::CodeExecution
        )
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FilesystemRead => write!(f, "filesystem_read"),
            Self::FilesystemWrite => write!(f, "filesystem_write"),
            Self::Shell => write!(f, "shell"),
            Self::CodeExecution => write!(f, "code_execution"),
            Self::Search => write!(f, "search"),
            Self::General => write!(f, "general"),
        }
    }
}

/// What a tool hands back to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Text fed back to the model
    pub content: String,
    /// The tool ran but reports failure (non-zero exit, missing file, ...)
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful output.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    /// Output describing a failure the model should see.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A capability the model can invoke.
///
/// Tools are registered once in a [`ToolRegistry`](super::ToolRegistry);
/// adding a capability means adding one implementation of this trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call the tool.
    fn name(&self) -> &str;

    /// One-line description shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    /// Category of the tool.
    fn category(&self) -> ToolCategory;

    /// Whether calls must pass the confirmation gate.
    fn is_destructive(&self) -> bool {
        self.category().is_destructive()
    }

    /// Run the tool. Arguments have already been validated against
    /// [`parameters`](Tool::parameters).
    ///
    /// Long-running tools should stream partial output into `ctx.output`
    /// and poll `ctx.is_cancelled()` at safe points.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Shared buffer a running tool writes partial output into.
///
/// The executor keeps a handle so it can report whatever was captured when a
/// tool times out.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text.
    pub fn push_str(&self, text: &str) {
        if let Ok(mut buf) = self.0.lock() {
            buf.push_str(text);
        }
    }

    /// Copy of everything captured so far.
    pub fn snapshot(&self) -> String {
        self.0.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

/// Execution context handed to every tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Workspace directory; file tools are confined to it
    pub workspace: Option<PathBuf>,
    /// Environment variables passed through to child processes
    pub env_allowlist: Vec<String>,
    /// Captured output is clipped to this many characters (0 = unlimited)
    pub max_output_chars: usize,
    /// Cooperative cancellation signal
    pub cancel: CancellationToken,
    /// Partial output sink
    pub output: OutputBuffer,
}

impl ToolContext {
    /// Create a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the workspace directory.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    /// Set the environment allowlist for child processes.
    pub fn with_env_allowlist(mut self, names: Vec<String>) -> Self {
        self.env_allowlist = names;
        self
    }

    /// Set the output clipping limit.
    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    /// Set the cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Set the partial output sink.
    pub fn with_output(mut self, output: OutputBuffer) -> Self {
        self.output = output;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checkpoint: returns `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TermpalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Allow-listed variables with their current values; unset ones are skipped.
    pub fn allowed_env(&self) -> Vec<(String, String)> {
        self.env_allowlist
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_context_new() {
        let ctx = ToolContext::new();
        assert!(ctx.workspace.is_none());
        assert!(ctx.env_allowlist.is_empty());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_tool_context_builder_chain() {
        let ctx = ToolContext::new()
            .with_workspace("/tmp/workspace")
            .with_env_allowlist(vec!["PATH".to_string()])
            .with_max_output_chars(100);

        assert_eq!(ctx.workspace, Some(PathBuf::from("/tmp/workspace")));
        assert_eq!(ctx.env_allowlist, vec!["PATH".to_string()]);
        assert_eq!(ctx.max_output_chars, 100);
    }

    #[test]
    fn test_checkpoint_after_cancel() {
        let token = CancellationToken::new();
        let ctx = ToolContext::new().with_cancellation(token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint(), Err(TermpalError::Cancelled)));
    }

    #[test]
    fn test_output_buffer_shared_between_clones() {
        let buf = OutputBuffer::new();
        let ctx = ToolContext::new().with_output(buf.clone());
        ctx.output.push_str("partial ");
        ctx.output.push_str("line");
        assert_eq!(buf.snapshot(), "partial line");
    }

    #[test]
    fn test_allowed_env_skips_unset() {
        std::env::set_var("TERMPAL_TEST_ALLOWED", "yes");
        let ctx = ToolContext::new().with_env_allowlist(vec![
            "TERMPAL_TEST_ALLOWED".to_string(),
            "TERMPAL_TEST_DEFINITELY_UNSET".to_string(),
        ]);
        let env = ctx.allowed_env();
        assert_eq!(
            env,
            vec![("TERMPAL_TEST_ALLOWED".to_string(), "yes".to_string())]
        );
        std::env::remove_var("TERMPAL_TEST_ALLOWED");
    }

    #[test]
    fn test_destructive_categories() {
        assert!(ToolCategory::Shell.is_destructive());
        assert!(ToolCategory::FilesystemWrite.is_destructive());
        assert!(ToolCategory::CodeExecution.is_destructive());
        assert!(!ToolCategory::FilesystemRead.is_destructive());
        assert!(!ToolCategory::Search.is_destructive());
        assert!(!ToolCategory::General.is_destructive());
    }

    #[test]
    fn test_tool_category_serde_roundtrip() {
        let cat = ToolCategory::CodeExecution;
        let json = serde_json::to_string(&cat).unwrap();
        assert_eq!(json, "\"code_execution\"");
        let back: ToolCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cat);
    }
}
