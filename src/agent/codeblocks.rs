//! Fenced code blocks as tool calls.
//!
//! Some models answer with a fenced block instead of a structured tool call.
//! When enabled, a completed response without structured calls is scanned
//! and each ```` ```bash ````, ```` ```sh ````, ```` ```terminal ```` or
//! ```` ```python ```` block becomes a `shell` or `python` call.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?ms)^```([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)^```[ \t]*$").ok())
        .as_ref()
}

/// Tool name and arguments for one recognised block.
fn block_call(lang: &str, body: &str) -> Option<(String, Value)> {
    let body = body.trim_end();
    if body.trim().is_empty() {
        return None;
    }
    match lang.to_ascii_lowercase().as_str() {
        "bash" | "sh" | "shell" | "terminal" => {
            Some(("shell".to_string(), json!({ "command": body })))
        }
        "python" | "py" => Some(("python".to_string(), json!({ "code": body }))),
        _ => None,
    }
}

/// Tool calls for the runnable blocks in `text`, in order of appearance.
///
/// # Example
/// ```
/// use termpal::agent::codeblocks::extract_tool_calls;
///
/// let text = "Let me look.\n```bash\nls -la\n```\n";
/// let calls = extract_tool_calls(text);
/// assert_eq!(calls.len(), 1);
/// assert_eq!(calls[0].0, "shell");
/// assert_eq!(calls[0].1["command"], "ls -la");
/// ```
pub fn extract_tool_calls(text: &str) -> Vec<(String, Value)> {
    let Some(fence) = fence_regex() else {
        return Vec::new();
    };
    fence
        .captures_iter(text)
        .filter_map(|caps| {
            let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            block_call(lang, body)
        })
        .collect()
}
