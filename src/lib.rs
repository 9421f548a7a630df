//! termpal - terminal-resident conversational assistant with tool use
//!
//! The crate is organised around the [`agent::AgentLoop`], which drives one
//! conversation: it records messages in a [`conversation::ConversationStore`],
//! selects the context window, streams model output from a
//! [`providers::ModelClient`] and runs tool calls through a
//! [`tools::ToolExecutor`].

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod providers;
pub mod retrieval;
pub mod runtime;
pub mod security;
pub mod tools;
pub mod utils;

pub use agent::{AgentLoop, TurnEvent, TurnHandle, TurnOutcome};
pub use config::Config;
pub use conversation::{Conversation, ConversationStore, Message, Role, ToolCall, ToolResult};
pub use error::{BackendError, Result, TermpalError};
pub use providers::{ModelClient, ToolDefinition, Usage};
