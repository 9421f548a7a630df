//! Python tool for termpal
//!
//! Runs a snippet with the configured interpreter. The code is fed on stdin
//! (`python3 -`) so it never appears in the process list.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Result, TermpalError};
use crate::runtime::{NativeRuntime, ProcessRuntime, ProcessSpec};
use crate::utils::string::preview;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};

/// Tool for running Python code.
pub struct PythonTool {
    interpreter: String,
    runtime: Arc<dyn ProcessRuntime>,
}

impl PythonTool {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            runtime: Arc::new(NativeRuntime::new()),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ProcessRuntime>) -> Self {
        self.runtime = runtime;
        self
    }
}

impl Default for PythonTool {
    fn default() -> Self {
        Self::new("python3")
    }
}

#[async_trait]
impl Tool for PythonTool {
    fn name(&self) -> &str {
        "python"
    }

    fn description(&self) -> &str {
        "Run Python code in the workspace and return its output and exit status"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::CodeExecution
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "Python source to execute",
                    "minLength": 1
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let code = args
            .get("code")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TermpalError::tool_failed("Missing 'code' argument"))?;

        let spec = ProcessSpec::from_context(self.interpreter.clone(), ctx)
            .arg("-")
            .with_stdin(code);
        let output = self.runtime.run(&spec, ctx).await?;

        let description = format!("{} - <<'EOF'\n{}\nEOF", self.interpreter, preview(code, 200));
        let text = output.render(&description, ctx.max_output_chars);
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
            Ok(CommandOutput::new(
                String::new(),
                "Traceback: boom\n".into(),
                Some(1),
            ))
        }
    }

    #[test]
    fn test_python_tool_properties() {
        let tool = PythonTool::default();
        assert_eq!(tool.name(), "python");
        assert!(tool.is_destructive());
        assert_eq!(tool.category(), ToolCategory::CodeExecution);
    }

    #[tokio::test]
    async fn test_python_tool_feeds_code_on_stdin() {
        let runtime = Arc::new(RecordingRuntime::default());
        let tool = PythonTool::new("python3.12").with_runtime(runtime.clone());
        let result = tool
            .execute(json!({"code": "print(1/0)"}), &ToolContext::new())
            .await
            .unwrap();

        let spec = runtime.seen.lock().unwrap().clone().unwrap();
        assert_eq!(spec.program, "python3.12");
        assert_eq!(spec.args, vec!["-"]);
        assert_eq!(spec.stdin.as_deref(), Some("print(1/0)"));

        assert!(result.is_error);
        assert!(result.content.contains("Traceback: boom"));
        assert!(result.content.ends_with("exit status: 1"));
    }

    #[tokio::test]
    async fn test_python_tool_missing_code() {
        let result = PythonTool::default()
            .execute(json!({}), &ToolContext::new())
            .await;
        assert!(result.is_err());
    }
}
