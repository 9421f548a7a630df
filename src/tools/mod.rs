//! Tools module - capabilities the model can invoke
//!
//! # Overview
//!
//! - [`Tool`] trait: the interface every capability implements
//! - [`ToolContext`]: per-call context (workspace, environment, cancellation,
//!   partial output)
//! - [`ToolRegistryBuilder`] / [`ToolRegistry`]: registration at startup,
//!   frozen and shared afterwards
//! - [`ToolExecutor`]: validation, confirmation gate and timeouts
//!
//! # Built-in Tools
//!
//! - `shell`: run a shell command (destructive)
//! - `python`: run Python code (destructive)
//! - `read_file`, `write_file` (destructive), `list_files`
//! - `search_docs`: keyword search over indexed documents
//! - `echo`: echoes its input, used in tests and examples
//!
//! # Example
//!
//! ```rust
//! use termpal::tools::{EchoTool, ExecutionPolicy, ToolExecutor, ToolRegistryBuilder};
//! use termpal::tools::filesystem::ListFilesTool;
//! use termpal::conversation::Message;
//! use tokio_util::sync::CancellationToken;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let registry = ToolRegistryBuilder::new()
//!     .register(EchoTool).unwrap()
//!     .register(ListFilesTool).unwrap()
//!     .build();
//! let executor = ToolExecutor::new(registry);
//!
//! let msg = Message::assistant_with_tool_calls(
//!     "",
//!     vec![("call_1".into(), "echo".into(), json!({"message": "Hello!"}))],
//! );
//! let result = executor
//!     .execute(&msg.tool_calls()[0], &ExecutionPolicy::default(), &CancellationToken::new())
//!     .await;
//! assert_eq!(result.output, "Hello!");
//! # });
//! ```

pub mod executor;
pub mod filesystem;
pub mod python;
mod registry;
pub mod schema;
pub mod search;
pub mod shell;
mod types;

pub use executor::{Confirmer, ExecutionPolicy, StaticConfirmer, ToolExecutor};
pub use registry::{ToolRegistry, ToolRegistryBuilder};
pub use types::{OutputBuffer, Tool, ToolCategory, ToolContext, ToolOutput};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::retrieval::SearchIndex;

/// A simple echo tool for testing purposes.
///
/// # Example
///
/// ```rust
/// use termpal::tools::{Tool, ToolContext, EchoTool};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let result = EchoTool.execute(json!({"message": "Hello"}), &ToolContext::new()).await;
/// assert_eq!(result.unwrap().content, "Hello");
/// # });
/// ```
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        Ok(ToolOutput::ok(message))
    }
}

/// Registry with the built-in tools configured from `config`.
///
/// `search_docs` is only registered when an index is supplied.
pub fn builtin_registry(
    config: &Config,
    index: Option<Arc<dyn SearchIndex>>,
) -> Result<ToolRegistry> {
    let mut builder = ToolRegistryBuilder::new()
        .register(shell::ShellTool::new())?
        .register(python::PythonTool::new(config.tools.python_bin.clone()))?
        .register(filesystem::ReadFileTool)?
        .register(filesystem::WriteFileTool)?
        .register(filesystem::ListFilesTool)?;
    if let Some(index) = index {
        builder = builder.register(search::SearchDocsTool::new(index))?;
    }
    Ok(builder.build())
}
