//! Runtime types shared by process runners.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;
use crate::tools::ToolContext;
use crate::utils::string::clip_middle;

/// What to run.
///
/// The environment is exactly `env`; nothing is inherited from the parent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Process spec seeded from a tool context: allow-listed environment and the
    /// workspace as working directory.
    pub fn from_context(program: impl Into<String>, ctx: &ToolContext) -> Self {
        let mut spec = Self::new(program).with_env(ctx.allowed_env());
        if let Some(ws) = &ctx.workspace {
            spec = spec.with_workdir(ws.clone());
        }
        spec
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn new(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Render for the model.
    ///
    /// Each stream is clipped to `max_chars` (0 = unlimited), keeping both
    /// ends of long output.
    pub fn render(&self, description: &str, max_chars: usize) -> String {
        let clip = |s: &str| {
            if max_chars == 0 {
                s.to_string()
            } else {
                clip_middle(s, max_chars)
            }
        };

        let mut out = format!("Ran command: {}\n", description);
        if !self.stdout.is_empty() {
            out.push_str("stdout:\n");
            out.push_str(clip(&self.stdout).trim_end());
            out.push('\n');
        }
        if !self.stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(clip(&self.stderr).trim_end());
            out.push('\n');
        }
        match self.exit_code {
            Some(code) => out.push_str(&format!("exit status: {}", code)),
            None => out.push_str("exit status: terminated by signal"),
        }
        out
    }
}

/// Something that can run a process under a tool context.
#[async_trait]
pub trait ProcessRuntime: Send + Sync {
    /// Runtime name for logs.
    fn name(&self) -> &str;

    /// Run to completion or until `ctx.cancel` fires.
    ///
    /// Output chunks are mirrored into `ctx.output` as they arrive. Returns
    /// `Err(Cancelled)` when the run was cut short.
    async fn run(&self, spec: &ProcessSpec, ctx: &ToolContext) -> Result<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sections() {
        let out = CommandOutput::new("a.txt\nb.txt\n".into(), "warning\n".into(), Some(0));
        let text = out.render("ls", 0);
        assert_eq!(
            text,
            "Ran command: ls\nstdout:\na.txt\nb.txt\nstderr:\nwarning\nexit status: 0"
        );
        assert!(out.success());
    }

    #[test]
    fn test_render_skips_empty_streams() {
        let out = CommandOutput::new(String::new(), String::new(), Some(3));
        assert_eq!(out.render("false", 100), "Ran command: false\nexit status: 3");
        assert!(!out.success());
    }

    #[test]
    fn test_render_clips_long_output() {
        let out = CommandOutput::new("x".repeat(1000), String::new(), Some(0));
        let text = out.render("yes", 100);
        assert!(text.contains("characters omitted"));
        assert!(text.chars().count() < 400);
    }

    #[test]
    fn test_render_signal() {
        let out = CommandOutput::new(String::new(), String::new(), None);
        assert!(out.render("sleep", 0).ends_with("terminated by signal"));
    }

    #[test]
    fn test_spec_from_context() {
        let ctx = ToolContext::new().with_workspace("/tmp/ws");
        let spec = ProcessSpec::from_context("sh", &ctx).arg("-c").arg("ls");
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "ls"]);
        assert_eq!(spec.workdir, Some(PathBuf::from("/tmp/ws")));
        assert!(spec.env.is_empty());
    }
}
