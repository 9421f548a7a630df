//! Conversation types for termpal
//!
//! This module defines the core conversation data model: messages, roles,
//! tool calls and tool results. Messages are immutable once created; a
//! conversation only ever grows by appending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, TermpalError, ToolErrorKind};

use super::tokens::estimate_tokens;

/// Role of the message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt / instructions
    System,
    /// Human user
    User,
    /// Model output
    Assistant,
    /// Tool execution result
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Whether a message holds the whole of what was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Complete,
    /// Generation stopped early (cancellation or a mid-stream backend error)
    Incomplete,
}

impl MessageStatus {
    fn is_complete(&self) -> bool {
        *self == MessageStatus::Complete
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend-assigned call identifier; `ToolResult::tool_call_id` refers to it
    pub id: String,
    /// Name of the registered tool
    pub tool_name: String,
    /// Structured arguments
    pub arguments: Value,
    /// Id of the assistant message that carries this call
    pub originating_message_id: String,
}

/// Outcome class of a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
    Timeout,
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStatus::Ok => write!(f, "ok"),
            ToolStatus::Error => write!(f, "error"),
            ToolStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of executing (or refusing to execute) one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    /// Successful execution.
    pub fn ok(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            output: output.into(),
            status: ToolStatus::Ok,
            error_kind: None,
        }
    }

    /// Failed or refused execution.
    pub fn error(call: &ToolCall, kind: ToolErrorKind, output: impl Into<String>) -> Self {
        let status = if kind == ToolErrorKind::ExecutionTimeout {
            ToolStatus::Timeout
        } else {
            ToolStatus::Error
        };
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            output: output.into(),
            status,
            error_kind: Some(kind),
        }
    }

    /// Execution ran past its deadline; `partial` is whatever was captured.
    pub fn timeout(call: &ToolCall, partial: impl Into<String>) -> Self {
        Self::error(call, ToolErrorKind::ExecutionTimeout, partial)
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// Message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    /// Plain text
    Text { text: String },
    /// Assistant output that requests tool executions
    ToolCalls { text: String, calls: Vec<ToolCall> },
    /// Output of one tool execution
    ToolResult(ToolResult),
    /// Synthesized stand-in for conversation messages `first_index..=last_index`
    Summary {
        text: String,
        first_index: usize,
        last_index: usize,
    },
    /// Retrieved document snippet offered as context
    Snippet { source: String, text: String },
}

impl Content {
    /// Text a model should see for this payload.
    pub fn text(&self) -> &str {
        match self {
            Content::Text { text }
            | Content::ToolCalls { text, .. }
            | Content::Summary { text, .. }
            | Content::Snippet { text, .. } => text,
            Content::ToolResult(result) => &result.output,
        }
    }

    fn token_estimate(&self) -> usize {
        match self {
            Content::Text { text } | Content::Summary { text, .. } => estimate_tokens(text),
            Content::ToolCalls { text, calls } => {
                let mut body = text.clone();
                for call in calls {
                    body.push_str(&call.tool_name);
                    body.push_str(&call.arguments.to_string());
                }
                estimate_tokens(&body)
            }
            Content::ToolResult(result) => {
                estimate_tokens(&format!("{}{}", result.tool_name, result.output))
            }
            Content::Snippet { source, text } => estimate_tokens(&format!("{}{}", source, text)),
        }
    }
}

/// A single message in a conversation.
///
/// Fields are private: a message is built once through one of the
/// constructors, which also fixes its `token_count`, and is read-only after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    role: Role,
    content: Content,
    timestamp: DateTime<Utc>,
    token_count: usize,
    #[serde(default, skip_serializing_if = "MessageStatus::is_complete")]
    status: MessageStatus,
}

impl Message {
    fn build(role: Role, content: Content) -> Self {
        Self::synthesized(uuid::Uuid::new_v4().to_string(), role, content, Utc::now())
    }

    /// Build a message with caller-chosen id and timestamp.
    ///
    /// Used for context-only messages (summaries, snippets) that must come
    /// out identical every time they are built from the same input.
    pub(crate) fn synthesized(
        id: String,
        role: Role,
        content: Content,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let token_count = content.token_estimate();
        Self {
            id,
            role,
            content,
            timestamp,
            token_count,
            status: MessageStatus::Complete,
        }
    }

    /// Create a new system message.
    ///
    /// # Example
    /// ```
    /// use termpal::conversation::{Message, Role};
    ///
    /// let msg = Message::system("You are a helper");
    /// assert_eq!(msg.role(), Role::System);
    /// assert!(msg.token_count() > 0);
    /// ```
    pub fn system(text: &str) -> Self {
        Self::build(
            Role::System,
            Content::Text {
                text: text.to_string(),
            },
        )
    }

    /// Create a new user message.
    pub fn user(text: &str) -> Self {
        Self::build(
            Role::User,
            Content::Text {
                text: text.to_string(),
            },
        )
    }

    /// Create a new assistant text message.
    pub fn assistant(text: &str) -> Self {
        Self::build(
            Role::Assistant,
            Content::Text {
                text: text.to_string(),
            },
        )
    }

    /// Create a partial assistant message, kept after generation stopped early.
    pub fn assistant_incomplete(text: &str) -> Self {
        let mut msg = Self::assistant(text);
        msg.status = MessageStatus::Incomplete;
        msg
    }

    /// Create an assistant message requesting tool calls.
    ///
    /// `calls` are given as `(call_id, tool_name, arguments)`; their
    /// `originating_message_id` is set to the new message's id.
    pub fn assistant_with_tool_calls(text: &str, calls: Vec<(String, String, Value)>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let calls = calls
            .into_iter()
            .map(|(call_id, tool_name, arguments)| ToolCall {
                id: call_id,
                tool_name,
                arguments,
                originating_message_id: id.clone(),
            })
            .collect();
        Self::synthesized(
            id,
            Role::Assistant,
            Content::ToolCalls {
                text: text.to_string(),
                calls,
            },
            Utc::now(),
        )
    }

    /// Create a tool-role message carrying a result.
    pub fn tool_result(result: ToolResult) -> Self {
        Self::build(Role::Tool, Content::ToolResult(result))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Model-visible text of this message.
    pub fn text(&self) -> &str {
        self.content.text()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Token estimate fixed at creation.
    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn is_incomplete(&self) -> bool {
        self.status == MessageStatus::Incomplete
    }

    /// Tool calls carried by this message, if any.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.content {
            Content::ToolCalls { calls, .. } => calls,
            _ => &[],
        }
    }

    /// The tool result carried by this message, if any.
    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match &self.content {
            Content::ToolResult(result) => Some(result),
            _ => None,
        }
    }
}

/// Conversation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub created_at: DateTime<Utc>,
    /// Backend label, e.g. `remote:gpt-4o` or `local:llama3`
    pub backend_used: String,
}

/// An ordered, append-only sequence of messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    id: String,
    meta: ConversationMeta,
    messages: Vec<Message>,
}

impl Conversation {
    /// Create a new empty conversation with a random id.
    pub fn new(backend_used: &str) -> Self {
        Self::with_id(&uuid::Uuid::new_v4().to_string(), backend_used)
    }

    /// Create a new empty conversation with the given id.
    pub fn with_id(id: &str, backend_used: &str) -> Self {
        Self {
            id: id.to_string(),
            meta: ConversationMeta {
                created_at: Utc::now(),
                backend_used: backend_used.to_string(),
            },
            messages: Vec::new(),
        }
    }

    /// Rebuild a conversation from persisted parts, re-checking every
    /// invariant along the way.
    pub fn from_parts(id: &str, meta: ConversationMeta, messages: Vec<Message>) -> Result<Self> {
        let mut conversation = Self {
            id: id.to_string(),
            meta,
            messages: Vec::with_capacity(messages.len()),
        };
        for message in messages {
            conversation.push(message)?;
        }
        Ok(conversation)
    }

    /// Check that `message` may be appended without breaking an invariant.
    pub fn check_append(&self, message: &Message) -> Result<()> {
        match (message.role(), message.content()) {
            (_, Content::Summary { .. }) | (_, Content::Snippet { .. }) => Err(TermpalError::User(
                "summary and snippet messages are context-only and cannot be stored".to_string(),
            )),
            (Role::System, Content::Text { .. }) => {
                if self.messages.is_empty() {
                    Ok(())
                } else {
                    Err(TermpalError::User(
                        "a system message may only be the first message".to_string(),
                    ))
                }
            }
            (Role::User, Content::Text { .. }) => Ok(()),
            (Role::Assistant, Content::Text { .. }) => Ok(()),
            (Role::Assistant, Content::ToolCalls { calls, .. }) => {
                let mut seen = HashSet::new();
                for call in calls {
                    if !seen.insert(call.id.as_str()) || self.find_tool_call(&call.id).is_some() {
                        return Err(TermpalError::User(format!(
                            "duplicate tool call id '{}'",
                            call.id
                        )));
                    }
                }
                Ok(())
            }
            (Role::Tool, Content::ToolResult(result)) => {
                if self.find_tool_call(&result.tool_call_id).is_none() {
                    return Err(TermpalError::User(format!(
                        "tool result references unknown tool call '{}'",
                        result.tool_call_id
                    )));
                }
                let answered = self.messages.iter().any(|m| {
                    m.as_tool_result()
                        .map(|r| r.tool_call_id == result.tool_call_id)
                        .unwrap_or(false)
                });
                if answered {
                    return Err(TermpalError::User(format!(
                        "tool call '{}' already has a result",
                        result.tool_call_id
                    )));
                }
                Ok(())
            }
            (role, _) => Err(TermpalError::User(format!(
                "content kind not allowed for a {} message",
                role
            ))),
        }
    }

    /// Append a message after checking the invariants.
    pub fn push(&mut self, message: Message) -> Result<()> {
        self.check_append(&message)?;
        self.messages.push(message);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &ConversationMeta {
        &self.meta
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The system message, if the conversation has one.
    pub fn system_message(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role() == Role::System)
    }

    /// Index of the most recent user message.
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role() == Role::User)
    }

    /// Tool calls that have no result yet, oldest first.
    pub fn unanswered_tool_calls(&self) -> Vec<&ToolCall> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| m.as_tool_result())
            .map(|r| r.tool_call_id.as_str())
            .collect();
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls())
            .filter(|c| !answered.contains(c.id.as_str()))
            .collect()
    }

    /// Sum of the cached token counts of all messages.
    pub fn total_tokens(&self) -> usize {
        self.messages.iter().map(Message::token_count).sum()
    }

    fn find_tool_call(&self, call_id: &str) -> Option<&ToolCall> {
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls())
            .find(|c| c.id == call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_message(call_id: &str) -> Message {
        Message::assistant_with_tool_calls(
            "",
            vec![(call_id.to_string(), "list_files".to_string(), json!({}))],
        )
    }

    #[test]
    fn test_constructors_set_roles_and_tokens() {
        let msg = Message::user("hello there");
        assert_eq!(msg.role(), Role::User);
        assert_eq!(msg.text(), "hello there");
        assert_eq!(msg.token_count(), estimate_tokens("hello there"));
        assert!(!msg.is_incomplete());
    }

    #[test]
    fn test_incomplete_assistant() {
        let msg = Message::assistant_incomplete("partial");
        assert!(msg.is_incomplete());
        assert_eq!(msg.status(), MessageStatus::Incomplete);
    }

    #[test]
    fn test_tool_calls_carry_originating_id() {
        let msg = call_message("call_1");
        assert_eq!(msg.tool_calls().len(), 1);
        assert_eq!(msg.tool_calls()[0].originating_message_id, msg.id());
    }

    #[test]
    fn test_system_message_must_be_first() {
        let mut conv = Conversation::new("test");
        conv.push(Message::system("sys")).unwrap();
        conv.push(Message::user("hi")).unwrap();
        assert!(conv.push(Message::system("again")).is_err());
        assert_eq!(conv.len(), 2);

        let mut conv = Conversation::new("test");
        conv.push(Message::user("hi")).unwrap();
        assert!(conv.push(Message::system("late")).is_err());
    }

    #[test]
    fn test_tool_result_must_reference_preceding_call() {
        let mut conv = Conversation::new("test");
        conv.push(Message::user("list")).unwrap();
        let call_msg = call_message("call_1");
        let call = call_msg.tool_calls()[0].clone();

        let orphan = Message::tool_result(ToolResult::ok(&call, "a.txt"));
        assert!(conv.push(orphan).is_err());

        conv.push(call_msg).unwrap();
        assert_eq!(conv.unanswered_tool_calls().len(), 1);
        conv.push(Message::tool_result(ToolResult::ok(&call, "a.txt")))
            .unwrap();
        assert!(conv.unanswered_tool_calls().is_empty());

        let duplicate = Message::tool_result(ToolResult::ok(&call, "again"));
        assert!(conv.push(duplicate).is_err());
    }

    #[test]
    fn test_summary_cannot_be_stored() {
        let mut conv = Conversation::new("test");
        let summary = Message::synthesized(
            "summary-0-1".to_string(),
            Role::System,
            Content::Summary {
                text: "earlier".to_string(),
                first_index: 0,
                last_index: 1,
            },
            Utc::now(),
        );
        assert!(conv.push(summary).is_err());
    }

    #[test]
    fn test_tool_result_timeout_status() {
        let msg = call_message("c");
        let result = ToolResult::timeout(&msg.tool_calls()[0], "partial out");
        assert_eq!(result.status, ToolStatus::Timeout);
        assert_eq!(result.error_kind, Some(ToolErrorKind::ExecutionTimeout));
        assert!(!result.is_ok());
    }

    #[test]
    fn test_message_serde_roundtrip() {
        let msg = Message::assistant_incomplete("hal");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"status\":\"incomplete\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);

        let complete = Message::user("hi");
        let json = serde_json::to_string(&complete).unwrap();
        assert!(!json.contains("status"));
    }

    #[test]
    fn test_last_user_index() {
        let mut conv = Conversation::new("test");
        conv.push(Message::system("s")).unwrap();
        conv.push(Message::user("a")).unwrap();
        conv.push(Message::assistant("b")).unwrap();
        conv.push(Message::user("c")).unwrap();
        assert_eq!(conv.last_user_index(), Some(3));
        assert!(conv.system_message().is_some());
    }
}
