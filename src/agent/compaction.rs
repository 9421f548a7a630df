//! Summaries for history that falls outside the context budget.
//!
//! The context window manager replaces a dropped range of old messages with
//! one synthesized summary message. The text comes from a [`Summarizer`];
//! the built-in [`ExtractiveSummarizer`] is deterministic so the same range
//! always summarizes to the same text.

use crate::conversation::tokens::clip_to_tokens;
use crate::conversation::{Content, Message};
use crate::utils::string::preview;

/// Turns a run of old messages into a short text.
pub trait Summarizer: Send + Sync {
    /// Summarize `messages` in at most `max_tokens` (as counted by
    /// [`estimate_tokens`](crate::conversation::tokens::estimate_tokens)).
    /// An empty string means "no summary".
    fn summarize(&self, messages: &[Message], max_tokens: usize) -> String;
}

/// Default characters kept from each replaced message.
pub const DEFAULT_EXCERPT_CHARS: usize = 120;

/// Keeps the head of each replaced message, one line per message, clipped
/// to the token budget.
///
/// # Example
/// ```
/// use termpal::agent::compaction::{ExtractiveSummarizer, Summarizer};
/// use termpal::conversation::Message;
///
/// let msgs = vec![
///     Message::user("Tell me about Rust"),
///     Message::assistant("Rust is a systems language..."),
/// ];
/// let summary = ExtractiveSummarizer::default().summarize(&msgs, 100);
/// assert!(summary.contains("user: Tell me about Rust"));
/// assert!(summary.contains("assistant: Rust is a systems language"));
/// ```
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    excerpt_chars: usize,
}

impl ExtractiveSummarizer {
    pub fn new(excerpt_chars: usize) -> Self {
        Self { excerpt_chars }
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new(DEFAULT_EXCERPT_CHARS)
    }
}

/// One transcript line for `msg`, without the leading bullet.
fn transcript_line(msg: &Message, excerpt_chars: usize) -> String {
    let flat = |s: &str| {
        let joined = s.split_whitespace().collect::<Vec<_>>().join(" ");
        preview(&joined, excerpt_chars)
    };
    match msg.content() {
        Content::ToolCalls { text, calls } => {
            let names: Vec<&str> = calls.iter().map(|c| c.tool_name.as_str()).collect();
            if text.trim().is_empty() {
                format!("assistant called {}", names.join(", "))
            } else {
                format!("assistant: {} (called {})", flat(text), names.join(", "))
            }
        }
        Content::ToolResult(result) => format!(
            "tool {} ({}): {}",
            result.tool_name,
            result.status,
            flat(&result.output)
        ),
        other => format!("{}: {}", msg.role(), flat(other.text())),
    }
}

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, messages: &[Message], max_tokens: usize) -> String {
        if messages.is_empty() {
            return String::new();
        }
        let mut text = String::from("Earlier in this conversation:");
        for msg in messages {
            text.push_str("\n- ");
            text.push_str(&transcript_line(msg, self.excerpt_chars));
        }
        clip_to_tokens(&text, max_tokens).unwrap_or_default()
    }
}
