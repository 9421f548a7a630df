//! Conversation module - messages, conversations and their durable log
//!
//! - [`types`]: the append-only conversation data model
//! - [`store`]: one JSON-lines file per conversation, crash-safe appends
//! - [`tokens`]: the deterministic token estimator used for budgets
//!
//! # Example
//!
//! ```
//! use termpal::conversation::{Conversation, ConversationStore, Message};
//!
//! # tokio_test::block_on(async {
//! let dir = tempfile::tempdir().unwrap();
//! let store = ConversationStore::new(dir.path()).unwrap();
//!
//! let mut conversation = Conversation::new("local:llama3");
//! conversation.push(Message::system("You are a helper")).unwrap();
//! store.create(&conversation).await.unwrap();
//!
//! let reply = Message::user("hello");
//! store.append(conversation.id(), &reply).await.unwrap();
//! conversation.push(reply).unwrap();
//!
//! let loaded = store.load(conversation.id()).await.unwrap();
//! assert_eq!(loaded.messages(), conversation.messages());
//! # });
//! ```

pub mod store;
pub mod tokens;
pub mod types;

pub use store::{ConversationInfo, ConversationStore};
pub use types::{
    Content, Conversation, ConversationMeta, Message, MessageStatus, Role, ToolCall, ToolResult,
    ToolStatus,
};
