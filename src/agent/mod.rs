//! Agent module - the conversation loop and its context handling
//!
//! The agent is responsible for:
//!
//! - Recording user messages and model responses in the conversation log
//! - Selecting the context window sent with each model request
//! - Streaming model output back to the caller
//! - Executing tool calls and feeding results back to the model
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  TurnHandle │<────│  AgentLoop  │────>│ ModelClient │
//! │  (events)   │     │             │     │ (streaming) │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │       │
//!                        ▼       ▼
//!              ┌──────────────┐ ┌──────────────┐
//!              │ Conversation │ │     Tool     │
//!              │    Store     │ │   Executor   │
//!              └──────────────┘ └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use termpal::agent::{AgentLoop, TurnEvent};
//! use termpal::conversation::ConversationStore;
//! use termpal::providers::{ScriptedClient, ScriptedTurn};
//! use termpal::tools::{EchoTool, ToolExecutor, ToolRegistryBuilder};
//!
//! # tokio_test::block_on(async {
//! let dir = tempfile::tempdir().unwrap();
//! let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
//! let client = Arc::new(ScriptedClient::new(vec![ScriptedTurn::chunks(&["Hi", " there"])]));
//! let registry = ToolRegistryBuilder::new().register(EchoTool).unwrap().build();
//!
//! let agent = AgentLoop::builder(client, ToolExecutor::new(registry), store)
//!     .create()
//!     .await
//!     .unwrap();
//!
//! let mut turn = agent.step("Hello").unwrap();
//! let mut reply = String::new();
//! while let Some(event) = turn.next().await {
//!     if let TurnEvent::Delta(text) = event {
//!         reply.push_str(&text);
//!     }
//! }
//! turn.finish().await.unwrap();
//! assert_eq!(reply, "Hi there");
//! # });
//! ```

pub mod codeblocks;
pub mod compaction;
mod context;
mod r#loop;
mod prompt;

pub use compaction::{ExtractiveSummarizer, Summarizer};
pub use context::{ContextWindow, ContextWindowManager};
pub use prompt::{PromptBuilder, RuntimeContext};
pub use r#loop::{
    AgentLoop, AgentLoopBuilder, AgentSettings, LoopState, TurnEvent, TurnHandle, TurnOutcome,
};
