//! Tool execution with validation, confirmation and timeouts.
//!
//! The executor never fails: every outcome, including refusal and unknown
//! tools, comes back as a [`ToolResult`] the model can read.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfirmationPolicy;
use crate::conversation::{ToolCall, ToolResult};
use crate::error::{TermpalError, ToolErrorKind};

use super::schema::validate_args;
use super::{OutputBuffer, Tool, ToolContext, ToolRegistry};

/// Asks whether a destructive tool call may run.
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Return `true` to allow the call.
    async fn confirm(&self, call: &ToolCall, tool: &dyn Tool) -> bool;
}

/// Confirmer with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticConfirmer(pub bool);

#[async_trait]
impl Confirmer for StaticConfirmer {
    async fn confirm(&self, _call: &ToolCall, _tool: &dyn Tool) -> bool {
        self.0
    }
}

/// Rules for one turn. Captured before the first tool runs and not changed
/// until the turn ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub confirmation: ConfirmationPolicy,
    pub timeout: Duration,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            confirmation: ConfirmationPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Runs tool calls against a frozen registry.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    confirmer: Option<Arc<dyn Confirmer>>,
    workspace: Option<PathBuf>,
    env_allowlist: Vec<String>,
    max_output_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            confirmer: None,
            workspace: None,
            env_allowlist: Vec::new(),
            max_output_chars: 0,
        }
    }

    /// Confirmer consulted under [`ConfirmationPolicy::PromptEachTime`].
    /// Without one, prompted calls are denied.
    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }

    pub fn with_env_allowlist(mut self, names: Vec<String>) -> Self {
        self.env_allowlist = names;
        self
    }

    pub fn with_max_output_chars(mut self, max: usize) -> Self {
        self.max_output_chars = max;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn context(&self, cancel: CancellationToken, output: OutputBuffer) -> ToolContext {
        let mut ctx = ToolContext::new()
            .with_env_allowlist(self.env_allowlist.clone())
            .with_max_output_chars(self.max_output_chars)
            .with_cancellation(cancel)
            .with_output(output);
        if let Some(ws) = &self.workspace {
            ctx = ctx.with_workspace(ws.clone());
        }
        ctx
    }

    /// Execute one call.
    ///
    /// `cancel` is the turn's token; the tool gets a child of it so a timeout
    /// can stop the tool without cancelling the turn.
    pub async fn execute(
        &self,
        call: &ToolCall,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let Some(tool) = self.registry.get(&call.tool_name) else {
            warn!(tool = %call.tool_name, "Unknown tool requested");
            return ToolResult::error(
                call,
                ToolErrorKind::UnknownTool,
                format!("Tool not found: {}", call.tool_name),
            );
        };

        if let Err(errors) = validate_args(&call.arguments, &tool.parameters()) {
            warn!(tool = %call.tool_name, %errors, "Tool arguments rejected");
            return ToolResult::error(
                call,
                ToolErrorKind::ArgumentValidation,
                format!("Invalid arguments for '{}': {}", call.tool_name, errors),
            );
        }

        if cancel.is_cancelled() {
            return ToolResult::error(call, ToolErrorKind::Cancelled, "Cancelled before start");
        }

        if tool.is_destructive() && !self.approve(call, tool.as_ref(), policy, cancel).await {
            if cancel.is_cancelled() {
                return ToolResult::error(
                    call,
                    ToolErrorKind::Cancelled,
                    "Cancelled while awaiting confirmation",
                );
            }
            info!(tool = %call.tool_name, policy = %policy.confirmation, "Tool call denied");
            return ToolResult::error(
                call,
                ToolErrorKind::Denied,
                format!(
                    "Execution of '{}' was not approved (policy: {})",
                    call.tool_name, policy.confirmation
                ),
            );
        }

        let token = cancel.child_token();
        let output = OutputBuffer::new();
        let ctx = self.context(token.clone(), output.clone());
        let start = Instant::now();

        let outcome =
            tokio::time::timeout(policy.timeout, tool.execute(call.arguments.clone(), &ctx)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => {
                token.cancel();
                let partial = output.snapshot();
                warn!(
                    tool = %call.tool_name,
                    timeout_secs = policy.timeout.as_secs_f64(),
                    partial_chars = partial.chars().count(),
                    "Tool execution timed out"
                );
                let body = if partial.is_empty() {
                    format!("Timed out after {:?}", policy.timeout)
                } else {
                    format!("Timed out after {:?}. Partial output:\n{}", policy.timeout, partial)
                };
                ToolResult::timeout(call, body)
            }
            Ok(Ok(out)) if out.is_error => {
                ToolResult::error(call, ToolErrorKind::ExecutionFailed, out.content)
            }
            Ok(Ok(out)) => ToolResult::ok(call, out.content),
            Ok(Err(TermpalError::Cancelled)) => {
                let partial = output.snapshot();
                let body = if partial.is_empty() {
                    "Cancelled".to_string()
                } else {
                    format!("Cancelled. Partial output:\n{}", partial)
                };
                ToolResult::error(call, ToolErrorKind::Cancelled, body)
            }
            Ok(Err(TermpalError::Tool { kind, message })) => ToolResult::error(call, kind, message),
            Ok(Err(e)) => ToolResult::error(call, ToolErrorKind::ExecutionFailed, e.to_string()),
        };

        info!(
            tool = %call.tool_name,
            status = %result.status,
            duration_ms,
            "Tool executed"
        );
        result
    }

    async fn approve(
        &self,
        call: &ToolCall,
        tool: &dyn Tool,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
    ) -> bool {
        match policy.confirmation {
            ConfirmationPolicy::AutoApprove => true,
            ConfirmationPolicy::DenyAll => false,
            ConfirmationPolicy::PromptEachTime => match &self.confirmer {
                Some(confirmer) => {
                    tokio::select! {
                        answer = confirmer.confirm(call, tool) => answer,
                        _ = cancel.cancelled() => false,
                    }
                }
                None => false,
            },
        }
    }
}
