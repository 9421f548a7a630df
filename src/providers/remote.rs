//! Remote client: OpenAI-compatible Chat Completions with SSE streaming
//!
//! Works against any endpoint that speaks the `/chat/completions` protocol
//! with `stream: true` (OpenAI, OpenRouter, vLLM, Groq, ...).
//!
//! # Example
//!
//! ```rust,ignore
//! use termpal::providers::{GenerateRequest, ModelClient, RemoteClient};
//! use termpal::conversation::Message;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() {
//!     let client = RemoteClient::new("your-api-key", "gpt-4o");
//!     let request = GenerateRequest {
//!         messages: vec![Message::user("Hello!")],
//!         ..Default::default()
//!     };
//!     let mut stream = client.generate(request, &CancellationToken::new()).await.unwrap();
//!     while let Some(delta) = stream.recv().await {
//!         println!("{:?}", delta);
//!     }
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conversation::{Content, Message, Role};
use crate::error::BackendError;

use super::{
    classify_status, classify_transport, delta_channel, streaming_http_client, take_lines, Delta,
    DeltaSender, DeltaStream, GenerateRequest, ModelClient, ToolCallFragment, ToolDefinition, Usage,
};

/// The OpenAI API endpoint URL.
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// The default remote model.
pub const DEFAULT_REMOTE_MODEL: &str = "gpt-4o";

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    /// Ask for a final usage chunk
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// A message in OpenAI's format.
#[derive(Debug, Serialize)]
struct OpenAIMessage {
    /// Role: "system", "user", "assistant", or "tool"
    role: &'static str,
    /// Message content (null for an assistant message that only calls tools)
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCallRequest>>,
    /// ID of the tool call this message is responding to
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCallRequest {
    id: String,
    r#type: &'static str,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    /// JSON-encoded arguments
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: &'static str,
    function: OpenAIFunctionDef,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// ============================================================================
// Stream Chunk Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
    #[serde(default)]
    r#type: String,
}

// ============================================================================
// Remote Client
// ============================================================================

/// Remote-hosted model backend.
pub struct RemoteClient {
    api_key: String,
    api_base: String,
    model: String,
    client: Client,
}

impl RemoteClient {
    /// Create a client for the default OpenAI endpoint.
    ///
    /// # Example
    /// ```
    /// use termpal::providers::{ModelClient, RemoteClient};
    ///
    /// let client = RemoteClient::new("sk-xxx", "gpt-4o-mini");
    /// assert_eq!(client.label(), "remote:gpt-4o-mini");
    /// ```
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_client(api_key, OPENAI_API_URL, model, Client::new())
    }

    /// Create a client for an OpenAI-compatible endpoint; a trailing slash on
    /// `api_base` is ignored.
    pub fn with_base_url(api_key: &str, api_base: &str, model: &str) -> Self {
        Self::with_client(api_key, api_base, model, Client::new())
    }

    /// Create a client with a custom HTTP client (timeouts, proxies).
    pub fn with_client(api_key: &str, api_base: &str, model: &str, client: Client) -> Self {
        let model = if model.is_empty() {
            DEFAULT_REMOTE_MODEL
        } else {
            model
        };
        Self {
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        }
    }

    /// Build a client that gives up when the backend sends nothing for
    /// `timeout`. A response that keeps streaming may take longer.
    pub fn with_timeout(
        api_key: &str,
        api_base: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = streaming_http_client(timeout)?;
        Ok(Self::with_client(api_key, api_base, model, client))
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn convert_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
    messages
        .iter()
        .map(|msg| match msg.content() {
            Content::ToolCalls { text, calls } => OpenAIMessage {
                role: "assistant",
                content: if text.is_empty() {
                    None
                } else {
                    Some(text.clone())
                },
                tool_calls: Some(
                    calls
                        .iter()
                        .map(|call| OpenAIToolCallRequest {
                            id: call.id.clone(),
                            r#type: "function",
                            function: OpenAIFunctionCall {
                                name: call.tool_name.clone(),
                                arguments: call.arguments.to_string(),
                            },
                        })
                        .collect(),
                ),
                tool_call_id: None,
            },
            Content::ToolResult(result) => OpenAIMessage {
                role: "tool",
                content: Some(result.output.clone()),
                tool_calls: None,
                tool_call_id: Some(result.tool_call_id.clone()),
            },
            Content::Summary { text, .. } => OpenAIMessage {
                role: "system",
                content: Some(format!("Summary of earlier conversation:\n{}", text)),
                tool_calls: None,
                tool_call_id: None,
            },
            Content::Snippet { source, text } => OpenAIMessage {
                role: "system",
                content: Some(format!("Reference [{}]:\n{}", source, text)),
                tool_calls: None,
                tool_call_id: None,
            },
            Content::Text { text } => OpenAIMessage {
                role: role_str(msg.role()),
                content: Some(text.clone()),
                tool_calls: None,
                tool_call_id: None,
            },
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OpenAITool> {
    tools
        .iter()
        .map(|t| OpenAITool {
            r#type: "function",
            function: OpenAIFunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

fn error_body(text: &str) -> String {
    match serde_json::from_str::<OpenAIErrorResponse>(text) {
        Ok(parsed) if parsed.error.r#type.is_empty() => parsed.error.message,
        Ok(parsed) => format!("{} - {}", parsed.error.r#type, parsed.error.message),
        Err(_) => text.to_string(),
    }
}

/// Outcome of feeding one SSE line to the parser.
#[derive(Debug, PartialEq)]
enum SseLine {
    Deltas(Vec<Delta>),
    Done,
    Skip,
}

/// Parse one SSE line into deltas. Usage is captured into `usage` and
/// reported with the end marker.
fn parse_sse_line(line: &str, usage: &mut Option<Usage>) -> SseLine {
    let data = match line
        .strip_prefix("data: ")
        .or_else(|| line.strip_prefix("data:"))
    {
        Some(data) => data.trim(),
        None => return SseLine::Skip,
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let chunk: ChunkResponse = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "Skipping unparsable SSE chunk");
            return SseLine::Skip;
        }
    };
    if let Some(u) = chunk.usage {
        *usage = Some(Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        });
    }

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
            deltas.push(Delta::Text(text));
        }
        for call in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            deltas.push(Delta::ToolCall(ToolCallFragment {
                index: call.index,
                id: call.id,
                name,
                arguments,
            }));
        }
    }
    SseLine::Deltas(deltas)
}

async fn pump_sse(response: reqwest::Response, tx: DeltaSender) {
    let byte_stream = response.bytes_stream();
    tokio::pin!(byte_stream);
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut usage = None;

    loop {
        let chunk = tokio::select! {
            chunk = byte_stream.next() => chunk,
            _ = tx.closed() => {
                debug!("Remote stream consumer went away; dropping connection");
                return;
            }
        };
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                tx.send(Delta::Error(classify_transport(&e))).await;
                return;
            }
            None => break,
        };
        line_buffer.extend_from_slice(&bytes);

        for line in take_lines(&mut line_buffer) {
            match parse_sse_line(&line, &mut usage) {
                SseLine::Deltas(deltas) => {
                    for delta in deltas {
                        if !tx.send(delta).await {
                            return;
                        }
                    }
                }
                SseLine::Done => {
                    tx.send(Delta::Done(usage)).await;
                    return;
                }
                SseLine::Skip => {}
            }
        }
    }

    tx.send(Delta::Error(BackendError::BackendUnavailable(
        "stream ended without [DONE]".to_string(),
    )))
    .await;
}

#[async_trait]
impl ModelClient for RemoteClient {
    fn name(&self) -> &str {
        "remote"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, BackendError> {
        let model = request
            .options
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.model.clone());
        let body = OpenAIRequest {
            model: model.clone(),
            messages: convert_messages(&request.messages),
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(convert_tools(&request.tools))
            },
            max_tokens: request.options.max_tokens,
            temperature: request.options.temperature,
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(model = %model, messages = body.messages.len(), "Remote request");

        let send = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();
        let response = tokio::select! {
            res = send => res.map_err(|e| classify_transport(&e))?,
            _ = cancel.cancelled() => {
                return Err(BackendError::BackendUnavailable("request cancelled".to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &error_body(&text)));
        }

        let (tx, stream) = delta_channel(cancel);
        tokio::spawn(pump_sse(response, tx));
        Ok(stream)
    }
}

// ============================================================================
// Tests
// ============================================================================
