//! Native runtime implementation
//!
//! Executes processes directly on the host. Isolation comes from the
//! application-level checks in [`crate::security`], a cleared environment and
//! an explicit working directory.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{Result, TermpalError};
use crate::tools::{OutputBuffer, ToolContext};

use super::types::{CommandOutput, ProcessRuntime, ProcessSpec};

/// How long a cancelled child may take to exit after SIGTERM before it is
/// killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Native runtime that executes processes directly on the host
#[derive(Debug, Clone)]
pub struct NativeRuntime {
    kill_grace: Duration,
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl NativeRuntime {
    /// Create a new native runtime
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

async fn pump<R>(reader: Option<R>, sink: OutputBuffer) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut captured = String::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let chunk = take_decoded(&mut pending);
                sink.push_str(&chunk);
                captured.push_str(&chunk);
            }
            Err(e) => {
                debug!(error = %e, "Output pipe closed with error");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let rest = String::from_utf8_lossy(&pending);
        sink.push_str(&rest);
        captured.push_str(&rest);
    }
    captured
}

/// Decode what `pending` holds, leaving behind a character cut off at the
/// end so the next read can complete it. Invalid bytes are replaced.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(complete);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

/// Ask the child to exit. Returns `false` when no signal could be sent.
#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "Could not send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

#[async_trait]
impl ProcessRuntime for NativeRuntime {
    fn name(&self) -> &str {
        "native"
    }

    async fn run(&self, spec: &ProcessSpec, ctx: &ToolContext) -> Result<CommandOutput> {
        ctx.checkpoint()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref workdir) = spec.workdir {
            cmd.current_dir(workdir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TermpalError::tool_failed(format!("Failed to start '{}': {}", spec.program, e))
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "Child closed stdin early");
                }
            });
        }

        let mut stdout_task = tokio::spawn(pump(child.stdout.take(), ctx.output.clone()));
        let mut stderr_task = tokio::spawn(pump(child.stderr.take(), ctx.output.clone()));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancel.cancelled() => {
                let asked = request_exit(&child);
                let exited = asked
                    && tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok();
                if exited {
                    debug!(program = %spec.program, "Cancelled process exited");
                } else {
                    warn!(program = %spec.program, "Killing cancelled process");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill process");
                    }
                }
                // Keep what the child wrote on its way out.
                let drain = async {
                    let _ = (&mut stdout_task).await;
                    let _ = (&mut stderr_task).await;
                };
                let _ = tokio::time::timeout(self.kill_grace, drain).await;
                return Err(TermpalError::Cancelled);
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|e| TermpalError::tool_failed(format!("stdout reader failed: {}", e)))?;
        let stderr = stderr_task
            .await
            .map_err(|e| TermpalError::tool_failed(format!("stderr reader failed: {}", e)))?;

        Ok(CommandOutput::new(stdout, stderr, status.code()))
    }
}
