//! Model client types for termpal
//!
//! This module defines the [`ModelClient`] trait every backend implements and
//! the streaming [`Delta`] protocol between a backend and the agent loop.
//!
//! A backend's `generate` establishes the request and returns a
//! [`DeltaStream`]. A producer task then feeds deltas through a bounded
//! channel until it sends [`Delta::Done`] or [`Delta::Error`]. Dropping the
//! stream cancels the producer, which releases the connection.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::conversation::Message;
use crate::error::BackendError;

/// Capacity of the delta channel between producer and consumer.
pub const DELTA_CHANNEL_CAPACITY: usize = 32;

/// Definition of a tool offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (must be unique)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    ///
    /// # Example
    /// ```
    /// use termpal::providers::ToolDefinition;
    /// use serde_json::json;
    ///
    /// let tool = ToolDefinition::new(
    ///     "search_docs",
    ///     "Search indexed documents",
    ///     json!({
    ///         "type": "object",
    ///         "properties": {
    ///             "query": { "type": "string", "description": "Search query" }
    ///         },
    ///         "required": ["query"]
    ///     }),
    /// );
    /// assert_eq!(tool.name, "search_docs");
    /// ```
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

/// Sampling options for one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    /// Model override; the client's default model when `None`
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Everything a backend needs for one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    /// Ordered context window
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub options: GenerateOptions,
}

/// Token usage reported by a backend at the end of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Piece of a tool call. Fragments with the same `index` belong to the same
/// call; `arguments` pieces concatenate into a JSON document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// One unit of streamed model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Text fragment
    Text(String),
    /// Structured tool-call fragment
    ToolCall(ToolCallFragment),
    /// Successful end of the stream
    Done(Option<Usage>),
    /// Failed end of the stream
    Error(BackendError),
}

impl Delta {
    /// Whether this delta ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Delta::Done(_) | Delta::Error(_))
    }
}

/// Producer half of a delta channel.
#[derive(Debug, Clone)]
pub struct DeltaSender {
    tx: mpsc::Sender<Delta>,
    cancel: CancellationToken,
}

impl DeltaSender {
    /// Send one delta. Returns `false` once the consumer has gone away or
    /// cancelled; the producer should stop and release its resources.
    pub async fn send(&self, delta: Delta) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(delta) => sent.is_ok(),
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Resolves when the consumer cancels or drops the stream.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.tx.closed() => {},
            _ = self.cancel.cancelled() => {},
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer half of a delta channel.
///
/// Dropping it cancels the producer.
pub struct DeltaStream {
    rx: mpsc::Receiver<Delta>,
    _guard: DropGuard,
}

impl DeltaStream {
    /// Next delta, or `None` once the producer has finished.
    pub async fn recv(&mut self) -> Option<Delta> {
        self.rx.recv().await
    }
}

impl Stream for DeltaStream {
    type Item = Delta;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delta>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for DeltaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaStream").finish_non_exhaustive()
    }
}

/// Create a delta channel whose producer stops when `parent` is cancelled
/// or the stream is dropped.
pub fn delta_channel(parent: &CancellationToken) -> (DeltaSender, DeltaStream) {
    let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
    let cancel = parent.child_token();
    let stream = DeltaStream {
        rx,
        _guard: cancel.clone().drop_guard(),
    };
    (DeltaSender { tx, cancel }, stream)
}

/// A model backend.
///
/// Implementations normalize every failure into a [`BackendError`]. Errors
/// detected before the first delta are returned from `generate`; later
/// failures arrive in-band as [`Delta::Error`].
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Short backend name, e.g. `remote` or `local`.
    fn name(&self) -> &str;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;

    /// Label recorded in conversation metadata, e.g. `remote:gpt-4o`.
    fn label(&self) -> String {
        format!("{}:{}", self.name(), self.default_model())
    }

    /// Start a generation.
    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<DeltaStream, BackendError>;
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Reassembles streamed tool-call fragments into complete calls.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<usize, PartialCall>,
}

/// A tool call assembled from fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments; unparsable text is kept as a JSON string so the
    /// executor reports an argument validation error for it
    pub arguments: Value,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: ToolCallFragment) {
        let call = self.calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id.filter(|s| !s.is_empty()) {
            call.id = Some(id);
        }
        if let Some(name) = fragment.name.filter(|s| !s.is_empty()) {
            call.name = Some(name);
        }
        call.arguments.push_str(&fragment.arguments);
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Complete calls in index order. Calls without a name are dropped;
    /// calls without an id get a generated one.
    pub fn finish(self) -> Vec<AssembledCall> {
        self.calls
            .into_values()
            .filter_map(|call| {
                let name = call.name?;
                let id = call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                let raw = call.arguments.trim();
                let arguments = if raw.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                };
                Some(AssembledCall {
                    id,
                    name,
                    arguments,
                })
            })
            .collect()
    }
}
