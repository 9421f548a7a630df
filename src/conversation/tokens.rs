//! Deterministic token estimation.
//!
//! Backends tokenize differently and none is available offline, so budgets
//! are enforced against a fixed estimate: one token per four characters plus
//! a per-message framing overhead. The same text always yields the same count.

/// Tokens charged per message for role and framing.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Estimate the token count of one message body.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4) + MESSAGE_OVERHEAD
}

/// Largest prefix of `text` (in chars) whose estimate fits in `max_tokens`.
///
/// Returns `None` when not even an empty body fits.
pub fn clip_to_tokens(text: &str, max_tokens: usize) -> Option<String> {
    let body_tokens = max_tokens.checked_sub(MESSAGE_OVERHEAD)?;
    let max_chars = body_tokens.saturating_mul(4);
    Some(text.chars().take(max_chars).collect())
}
