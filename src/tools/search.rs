//! Document search tool backed by a [`SearchIndex`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{Result, TermpalError};
use crate::retrieval::SearchIndex;

use super::{Tool, ToolCategory, ToolContext, ToolOutput};

const DEFAULT_LIMIT: u64 = 5;

/// Lets the model search indexed workspace documents on its own.
pub struct SearchDocsTool {
    index: Arc<dyn SearchIndex>,
}

impl SearchDocsTool {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl Tool for SearchDocsTool {
    fn name(&self) -> &str {
        "search_docs"
    }

    fn description(&self) -> &str {
        "Search indexed workspace documents by keywords and return the best matching passages"
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Keywords to search for",
                    "minLength": 1
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of passages (default: 5)",
                    "minimum": 1,
                    "maximum": 20
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TermpalError::tool_failed("Missing 'query' argument"))?;
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LIMIT) as usize;

        ctx.checkpoint()?;
        let hits = self.index.search(query, limit).await?;
        if hits.is_empty() {
            return Ok(ToolOutput::ok(format!("No documents match '{}'", query)));
        }

        let body = hits
            .iter()
            .map(|hit| format!("[{}] (score {:.2})\n{}", hit.source, hit.score, hit.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(ToolOutput::ok(body))
    }
}
