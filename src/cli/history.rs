//! Stored conversation commands (list, show, delete).

use anyhow::{bail, Result};

use termpal::config::Config;
use termpal::conversation::{Content, Conversation, Message};
use termpal::utils::string::preview;

use super::common::open_store;

pub(crate) async fn cmd_list(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let conversations = store.list().await?;
    if conversations.is_empty() {
        println!("No conversations in {}", store.dir().display());
        return Ok(());
    }
    for info in &conversations {
        println!(
            "{}  {}  {}",
            info.created_at.format("%Y-%m-%d %H:%M:%S"),
            info.id,
            info.backend_used
        );
    }
    println!();
    println!("{} conversation(s).", conversations.len());
    Ok(())
}

pub(crate) async fn cmd_show(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config)?;
    if !store.exists(id).await {
        bail!("No conversation with id '{}'", id);
    }
    let conversation = store.load(id).await?;
    println!(
        "Conversation {} ({}, started {})",
        conversation.id(),
        conversation.meta().backend_used,
        conversation.meta().created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();
    print_transcript(&conversation, None);
    Ok(())
}

pub(crate) async fn cmd_delete(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.delete(id).await? {
        println!("Deleted conversation {}", id);
    } else {
        bail!("No conversation with id '{}'", id);
    }
    Ok(())
}

/// Print every message; `limit` shortens each body to that many characters.
pub(crate) fn print_transcript(conversation: &Conversation, limit: Option<usize>) {
    for message in conversation.messages() {
        println!("{}", render_message(message, limit));
    }
}

fn render_message(message: &Message, limit: Option<usize>) -> String {
    let clip = |text: &str| match limit {
        Some(n) => preview(text, n),
        None => text.to_string(),
    };
    let marker = if message.is_incomplete() { " (incomplete)" } else { "" };
    match message.content() {
        Content::ToolCalls { text, calls } => {
            let mut out = format!("[assistant{}]", marker);
            if !text.trim().is_empty() {
                out.push('\n');
                out.push_str(&clip(text));
            }
            for call in calls {
                out.push_str(&format!("\n-> {} {}", call.tool_name, clip(&call.arguments.to_string())));
            }
            out
        }
        Content::ToolResult(result) => format!(
            "[tool {} ({})]\n{}",
            result.tool_name,
            result.status,
            clip(&result.output)
        ),
        other => format!("[{}{}]\n{}", message.role(), marker, clip(other.text())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use termpal::conversation::ToolResult;

    #[test]
    fn test_render_tool_messages() {
        let call_msg = Message::assistant_with_tool_calls(
            "checking",
            vec![("c1".into(), "list_files".into(), json!({"path": "."}))],
        );
        let rendered = render_message(&call_msg, None);
        assert!(rendered.starts_with("[assistant]\nchecking"));
        assert!(rendered.contains("-> list_files {\"path\":\".\"}"));

        let result = Message::tool_result(ToolResult::ok(&call_msg.tool_calls()[0], "a.txt"));
        assert_eq!(render_message(&result, None), "[tool list_files (ok)]\na.txt");
    }

    #[test]
    fn test_render_incomplete_and_limit() {
        let msg = Message::assistant_incomplete("abcdefghij");
        assert_eq!(render_message(&msg, Some(3)), "[assistant (incomplete)]\nabc...");
    }
}
