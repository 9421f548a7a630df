//! Shell tool for termpal
//!
//! This module provides a tool for executing shell commands. Commands are run
//! with `sh -c` in the workspace directory, with a cleared environment.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, TermpalError};
use crate::runtime::{NativeRuntime, ProcessRuntime, ProcessSpec};
use crate::security::ShellSecurityConfig;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};

/// Tool for executing shell commands.
///
/// Returns the command, its stdout and stderr, and its exit status. A
/// non-zero exit is reported as a failed execution with the same text.
///
/// # Parameters
/// - `command`: The shell command to execute (required)
///
/// # Security
/// Commands are validated against a regex blocklist before anything runs.
/// Use `ShellTool::permissive()` to disable the check in trusted environments.
///
/// # Example
/// ```rust
/// use termpal::tools::{Tool, ToolContext};
/// use termpal::tools::shell::ShellTool;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let tool = ShellTool::new();
/// let ctx = ToolContext::new().with_env_allowlist(vec!["PATH".into()]);
/// let result = tool.execute(json!({"command": "echo hello"}), &ctx).await.unwrap();
/// assert!(result.content.contains("stdout:\nhello"));
/// # });
/// ```
pub struct ShellTool {
    security_config: ShellSecurityConfig,
    runtime: Arc<dyn ProcessRuntime>,
}

impl ShellTool {
    /// Create a new shell tool with default security settings and native runtime.
    pub fn new() -> Self {
        Self {
            security_config: ShellSecurityConfig::new(),
            runtime: Arc::new(NativeRuntime::new()),
        }
    }

    /// Create a shell tool with custom security configuration.
    pub fn with_security(security_config: ShellSecurityConfig) -> Self {
        Self {
            security_config,
            runtime: Arc::new(NativeRuntime::new()),
        }
    }

    /// Create a shell tool with default security and custom runtime.
    pub fn with_runtime(runtime: Arc<dyn ProcessRuntime>) -> Self {
        Self {
            security_config: ShellSecurityConfig::new(),
            runtime,
        }
    }

    /// Create a shell tool with no security restrictions.
    ///
    /// # Warning
    /// Only use in trusted environments where command injection is not a concern.
    pub fn permissive() -> Self {
        Self::with_security(ShellSecurityConfig::permissive())
    }

    /// Get the name of the runtime being used.
    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its output and exit status"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute",
                    "minLength": 1
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TermpalError::tool_failed("Missing 'command' argument"))?;

        self.security_config.validate_command(command)?;

        debug!(runtime = self.runtime.name(), command, "Running shell command");
        let spec = ProcessSpec::from_context("sh", ctx).arg("-c").arg(command);
        let output = self.runtime.run(&spec, ctx).await?;

        let text = output.render(command, ctx.max_output_chars);
        if output.success() {
            Ok(ToolOutput::ok(text))
        } else {
            Ok(ToolOutput::error(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CommandOutput;
    use std::sync::Mutex;

    fn ctx() -> ToolContext {
        ToolContext::new().with_env_allowlist(vec!["PATH".to_string()])
    }

    /// Records the process it was asked to run instead of running anything.
    #[derive(Default)]
    struct RecordingRuntime {
        seen: Mutex<Option<ProcessSpec>>,
    }

    #[async_trait]
    impl ProcessRuntime for RecordingRuntime {
        fn name(&self) -> &str {
            "recording"
        }

        async fn run(&self, spec: &ProcessSpec, _ctx: &ToolContext) -> Result<CommandOutput> {
            *self.seen.lock().unwrap() = Some(spec.clone());
            Ok(CommandOutput::new("ok\n".into(), String::new(), Some(0)))
        }
    }

    #[test]
    fn test_shell_tool_properties() {
        let tool = ShellTool::new();
        assert_eq!(tool.name(), "shell");
        assert!(tool.is_destructive());
        assert_eq!(tool.runtime_name(), "native");
        assert_eq!(tool.parameters()["required"][0], "command");
    }

    #[tokio::test]
    async fn test_shell_tool_simple_command() {
        let result = ShellTool::new()
            .execute(json!({"command": "echo hello"}), &ctx())
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.content.starts_with("Ran command: echo hello"));
        assert!(result.content.contains("stdout:\nhello"));
        assert!(result.content.ends_with("exit status: 0"));
    }

    #[tokio::test]
    async fn test_shell_tool_nonzero_exit_is_error() {
        let result = ShellTool::new()
            .execute(json!({"command": "echo bad >&2; exit 3"}), &ctx())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("stderr:\nbad"));
        assert!(result.content.contains("exit status: 3"));
    }

    #[tokio::test]
    async fn test_shell_tool_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let ctx = ctx().with_workspace(dir.path());
        let result = ShellTool::new()
            .execute(json!({"command": "ls"}), &ctx)
            .await
            .unwrap();
        assert!(result.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_shell_tool_blocked_command() {
        let result = ShellTool::new()
            .execute(json!({"command": "rm -rf /"}), &ctx())
            .await;
        assert!(matches!(result, Err(TermpalError::SecurityViolation(_))));
    }

    #[tokio::test]
    async fn test_shell_tool_custom_runtime() {
        let runtime = Arc::new(RecordingRuntime::default());
        let tool = ShellTool::with_runtime(runtime.clone());
        tool.execute(json!({"command": "true"}), &ctx().with_workspace("/ws"))
            .await
            .unwrap();
        let spec = runtime.seen.lock().unwrap().clone().unwrap();
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "true"]);
        assert_eq!(spec.workdir, Some(std::path::PathBuf::from("/ws")));
    }

    #[tokio::test]
    async fn test_shell_tool_clips_output() {
        let ctx = ctx().with_max_output_chars(40);
        let result = ShellTool::new()
            .execute(json!({"command": "seq 1 500"}), &ctx)
            .await
            .unwrap();
        assert!(result.content.contains("characters omitted"));
        assert!(result.content.contains("500"));
    }
}
