//! Retrieval module - context snippets from an external index
//!
//! [`RetrievalAugmenter`] asks a [`SearchIndex`] for snippets relevant to the
//! current user message and turns them into candidate context messages. It
//! never writes to the conversation store; the agent loop hands the
//! candidates to the context window manager, which decides what fits.

pub mod bm25;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::conversation::{Content, Message, Role};
use crate::error::Result;

pub use bm25::Bm25Index;

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Snippet {
    /// Where the text came from, e.g. `docs/setup.md#2`
    pub source: String,
    pub text: String,
    /// Relevance in `0.0..=1.0`
    pub score: f32,
}

/// An external index or search collaborator.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Best `k` snippets for `query`, most relevant first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Snippet>>;
}

/// Turns search hits into candidate context messages.
#[derive(Clone)]
pub struct RetrievalAugmenter {
    index: Arc<dyn SearchIndex>,
    top_k: usize,
    min_score: f32,
}

impl RetrievalAugmenter {
    pub fn new(index: Arc<dyn SearchIndex>, top_k: usize, min_score: f32) -> Self {
        Self {
            index,
            top_k,
            min_score,
        }
    }

    /// Candidate snippet messages for `user_message`, best first.
    ///
    /// Message ids come from rank and source, and the timestamp is the user
    /// message's, so the same query against the same index always yields
    /// identical messages. A failing search yields no candidates.
    pub async fn candidates(&self, user_message: &Message) -> Vec<Message> {
        let query = user_message.text();
        let hits = match self.index.search(query, self.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(index = self.index.name(), error = %e, "Retrieval failed; continuing without snippets");
                return Vec::new();
            }
        };

        let candidates: Vec<Message> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.min_score)
            .take(self.top_k)
            .enumerate()
            .map(|(rank, hit)| {
                Message::synthesized(
                    format!("snippet-{}-{}", rank, hit.source),
                    Role::System,
                    Content::Snippet {
                        source: hit.source,
                        text: hit.text,
                    },
                    user_message.timestamp(),
                )
            })
            .collect();

        debug!(
            index = self.index.name(),
            count = candidates.len(),
            "Retrieved context snippets"
        );
        candidates
    }
}
