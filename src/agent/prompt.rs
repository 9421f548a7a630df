//! System prompt construction
//!
//! The system message is built once, when a conversation is created, from
//! the configured prompt text, the registered tools and a short runtime
//! context section. It is then stored as the conversation's first message.

use crate::conversation::Message;
use crate::tools::ToolRegistry;

pub use crate::config::DEFAULT_SYSTEM_PROMPT;

/// Runtime context appended to the system prompt.
///
/// # Example
///
/// ```rust
/// use termpal::agent::RuntimeContext;
///
/// let ctx = RuntimeContext::new()
///     .with_workspace("/home/user/project")
///     .with_os_info();
///
/// let rendered = ctx.render().unwrap();
/// assert!(rendered.contains("Workspace: /home/user/project"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    /// Workspace path tools operate in
    pub workspace: Option<String>,
    /// OS/platform info (e.g., "linux x86_64")
    pub os_info: Option<String>,
    /// Date the conversation started (ISO 8601)
    pub current_date: Option<String>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }

    /// Set the OS/platform info from the current environment.
    pub fn with_os_info(mut self) -> Self {
        self.os_info = Some(format!(
            "{} {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));
        self
    }

    /// Set the date to today (UTC).
    pub fn with_current_date(mut self) -> Self {
        self.current_date = Some(chrono::Utc::now().format("%Y-%m-%d").to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.workspace.is_none() && self.os_info.is_none() && self.current_date.is_none()
    }

    /// Render the context as a markdown section, or `None` when empty.
    pub fn render(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }

        let mut parts = Vec::new();
        if let Some(ref workspace) = self.workspace {
            parts.push(format!("- Workspace: {}", workspace));
        }
        if let Some(ref os) = self.os_info {
            parts.push(format!("- Platform: {}", os));
        }
        if let Some(ref date) = self.current_date {
            parts.push(format!("- Date: {}", date));
        }

        Some(format!("## Runtime Context\n\n{}", parts.join("\n")))
    }
}

/// Builds the system message for a new conversation.
///
/// # Example
///
/// ```rust
/// use termpal::agent::PromptBuilder;
/// use termpal::tools::{EchoTool, ToolRegistryBuilder};
///
/// let registry = ToolRegistryBuilder::new().register(EchoTool).unwrap().build();
/// let prompt = PromptBuilder::new()
///     .with_system_prompt("You are a helper")
///     .with_tools(&registry)
///     .build();
/// assert!(prompt.starts_with("You are a helper"));
/// assert!(prompt.contains("- echo: Echoes back the provided message"));
/// ```
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    tools: Vec<(String, String)>,
    runtime_context: Option<RuntimeContext>,
}

impl PromptBuilder {
    /// Create a builder with the default prompt text.
    pub fn new() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            tools: Vec::new(),
            runtime_context: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// List the registry's tools, in name order.
    pub fn with_tools(mut self, registry: &ToolRegistry) -> Self {
        self.tools = registry
            .definitions()
            .into_iter()
            .map(|d| (d.name, d.description))
            .collect();
        self
    }

    pub fn with_runtime_context(mut self, ctx: RuntimeContext) -> Self {
        self.runtime_context = Some(ctx);
        self
    }

    /// Full prompt text.
    pub fn build(&self) -> String {
        let mut prompt = self.system_prompt.trim_end().to_string();
        if !self.tools.is_empty() {
            prompt.push_str("\n\n## Tools\n");
            for (name, description) in &self.tools {
                prompt.push_str(&format!("\n- {}: {}", name, description));
            }
        }
        if let Some(rendered) = self.runtime_context.as_ref().and_then(RuntimeContext::render) {
            prompt.push_str("\n\n");
            prompt.push_str(&rendered);
        }
        prompt
    }

    pub fn build_message(&self) -> Message {
        Message::system(&self.build())
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
