//! Context window selection
//!
//! [`ContextWindowManager`] picks the messages sent to the model for one
//! generation. Selection order:
//!
//! 1. the system message
//! 2. every message since the most recent user message (the current turn)
//! 3. as much older history as fits, newest first
//!
//! History is walked in units: an assistant message that requests tool calls
//! travels together with the tool results answering it. The walk stops at the
//! first unit that does not fit, so dropped messages always form one
//! contiguous older range. With a [`Summarizer`] configured, that range is
//! replaced by a single synthesized summary message.
//!
//! Retrieval snippets compete with history for the same budget according to
//! [`RetrievalPrecedence`].
//!
//! Selection is a pure function of the conversation, the budget and the
//! candidates: summary ids and timestamps derive from the replaced range, so
//! repeated calls return identical windows.

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RetrievalPrecedence;
use crate::conversation::{Content, Conversation, Message, Role};

use super::compaction::Summarizer;

/// Messages selected for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindow {
    /// Ordered as system, summary, snippets, history, current turn
    pub messages: Vec<Message>,
    pub total_tokens: usize,
    /// Inclusive conversation index range that was left out
    pub dropped: Option<(usize, usize)>,
    /// The current turn alone exceeded the budget and lost its oldest units
    pub truncated_turn: bool,
}

impl ContextWindow {
    /// Whether a summary message stands in for dropped history.
    pub fn has_summary(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m.content(), Content::Summary { .. }))
    }
}

/// Budgeted selection of context messages.
#[derive(Clone)]
pub struct ContextWindowManager {
    budget: usize,
    precedence: RetrievalPrecedence,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl std::fmt::Debug for ContextWindowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextWindowManager")
            .field("budget", &self.budget)
            .field("precedence", &self.precedence)
            .field("summarizer", &self.summarizer.is_some())
            .finish()
    }
}

impl ContextWindowManager {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            precedence: RetrievalPrecedence::default(),
            summarizer: None,
        }
    }

    pub fn with_precedence(mut self, precedence: RetrievalPrecedence) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Select a window within the configured budget.
    pub fn build(&self, conversation: &Conversation, candidates: &[Message]) -> ContextWindow {
        self.build_with_budget(conversation, self.budget, candidates)
    }

    /// Select a window whose token total never exceeds `budget`.
    ///
    /// A system message larger than `budget` is left out with a warning.
    pub fn build_with_budget(
        &self,
        conversation: &Conversation,
        budget: usize,
        candidates: &[Message],
    ) -> ContextWindow {
        let messages = conversation.messages();
        let mut remaining = budget;

        let mut rest_start = 0;
        let mut system = None;
        if let Some(sys) = conversation.system_message() {
            rest_start = 1;
            if sys.token_count() <= remaining {
                remaining -= sys.token_count();
                system = Some(sys.clone());
            } else {
                warn!(
                    conversation = conversation.id(),
                    budget,
                    system_tokens = sys.token_count(),
                    "System message exceeds the context budget"
                );
            }
        }

        let turn_start = conversation
            .last_user_index()
            .unwrap_or(messages.len())
            .max(rest_start);
        let units = units(messages, rest_start);
        let split = units
            .iter()
            .position(|u| u.start >= turn_start)
            .unwrap_or(units.len());
        let (history_units, turn_units) = units.split_at(split);

        // Oldest conversation index that made it into the window.
        let mut kept_from = messages.len();
        let mut truncated_turn = false;
        for unit in turn_units.iter().rev() {
            let cost = unit_tokens(messages, unit);
            if cost > remaining {
                truncated_turn = true;
                break;
            }
            remaining -= cost;
            kept_from = unit.start;
        }

        let mut snippets = Vec::new();
        if self.precedence == RetrievalPrecedence::RetrievalFirst {
            snippets = fit_candidates(candidates, &mut remaining);
        }
        if !truncated_turn {
            for unit in history_units.iter().rev() {
                let cost = unit_tokens(messages, unit);
                if cost > remaining {
                    break;
                }
                remaining -= cost;
                kept_from = unit.start;
            }
        }

        let dropped = (kept_from > rest_start).then(|| (rest_start, kept_from - 1));
        let mut summary = None;
        if let (Some(summarizer), Some((first, last))) = (&self.summarizer, dropped) {
            summary = summary_message(summarizer.as_ref(), messages, first, last, remaining);
            if let Some(msg) = &summary {
                remaining -= msg.token_count();
            }
        }
        if self.precedence == RetrievalPrecedence::HistoryFirst {
            snippets = fit_candidates(candidates, &mut remaining);
        }

        let mut selected = Vec::with_capacity(messages.len() + snippets.len() + 2);
        selected.extend(system);
        selected.extend(summary);
        selected.extend(snippets);
        selected.extend(messages.iter().skip(kept_from).cloned());

        let total_tokens: usize = selected.iter().map(Message::token_count).sum();
        debug!(
            conversation = conversation.id(),
            budget,
            total_tokens,
            selected = selected.len(),
            dropped = ?dropped,
            truncated_turn,
            "Context window selected"
        );

        ContextWindow {
            messages: selected,
            total_tokens,
            dropped,
            truncated_turn,
        }
    }
}

/// Split `messages[start..]` into units: each tool-role message joins the
/// unit before it.
fn units(messages: &[Message], start: usize) -> Vec<Range<usize>> {
    let mut units: Vec<Range<usize>> = Vec::new();
    for (i, msg) in messages.iter().enumerate().skip(start) {
        match units.last_mut() {
            Some(unit) if msg.role() == Role::Tool => unit.end = i + 1,
            _ => units.push(i..i + 1),
        }
    }
    units
}

fn unit_tokens(messages: &[Message], unit: &Range<usize>) -> usize {
    messages[unit.clone()].iter().map(Message::token_count).sum()
}

/// Candidates in rank order that still fit; ones that do not are skipped.
fn fit_candidates(candidates: &[Message], remaining: &mut usize) -> Vec<Message> {
    let mut kept = Vec::new();
    for candidate in candidates {
        if candidate.token_count() <= *remaining {
            *remaining -= candidate.token_count();
            kept.push(candidate.clone());
        }
    }
    kept
}

fn summary_message(
    summarizer: &dyn Summarizer,
    messages: &[Message],
    first: usize,
    last: usize,
    remaining: usize,
) -> Option<Message> {
    let replaced = &messages[first..=last];
    let text = summarizer.summarize(replaced, remaining);
    if text.is_empty() {
        return None;
    }
    let msg = Message::synthesized(
        format!("summary-{}-{}", first, last),
        Role::System,
        Content::Summary {
            text,
            first_index: first,
            last_index: last,
        },
        replaced[replaced.len() - 1].timestamp(),
    );
    (msg.token_count() <= remaining).then_some(msg)
}
