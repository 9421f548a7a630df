//! Local client: Ollama-style `/api/chat` with NDJSON streaming
//!
//! Each response line is one JSON object. Text arrives in
//! `message.content`, complete tool calls in `message.tool_calls`, and the
//! final line carries `"done": true` with token counts.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conversation::{Content, Message, Role};
use crate::error::BackendError;

use super::{
    classify_status, classify_transport, delta_channel, streaming_http_client, take_lines, Delta,
    DeltaSender, DeltaStream, GenerateRequest, ModelClient, ToolCallFragment, ToolDefinition, Usage,
};

/// Default Ollama endpoint.
pub const OLLAMA_API_URL: &str = "http://localhost:11434";

/// The default local model.
pub const DEFAULT_LOCAL_MODEL: &str = "llama3.1";

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool>,
    stream: bool,
    #[serde(skip_serializing_if = "OllamaOptions::is_empty")]
    options: OllamaOptions,
}

#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl OllamaOptions {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_predict.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct OllamaTool {
    r#type: &'static str,
    function: ToolDefinition,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

/// Locally served model backend.
pub struct LocalClient {
    api_base: String,
    model: String,
    client: Client,
}

impl LocalClient {
    /// Client for an Ollama server at `api_base` (default when `None`).
    pub fn new(api_base: Option<&str>, model: &str) -> Self {
        Self::with_client(api_base, model, Client::new())
    }

    pub fn with_client(api_base: Option<&str>, model: &str, client: Client) -> Self {
        let model = if model.is_empty() {
            DEFAULT_LOCAL_MODEL
        } else {
            model
        };
        Self {
            api_base: api_base
                .unwrap_or(OLLAMA_API_URL)
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            client,
        }
    }

    /// Build a client that gives up when the backend sends nothing for
    /// `timeout`. A response that keeps streaming may take longer.
    pub fn with_timeout(
        api_base: Option<&str>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = streaming_http_client(timeout)?;
        Ok(Self::with_client(api_base, model, client))
    }
}

fn convert_messages(messages: &[Message]) -> Vec<OllamaMessage> {
    messages
        .iter()
        .map(|msg| {
            let (role, content, tool_calls) = match msg.content() {
                Content::ToolCalls { text, calls } => (
                    "assistant",
                    text.clone(),
                    calls
                        .iter()
                        .map(|c| OllamaToolCall {
                            function: OllamaFunction {
                                name: c.tool_name.clone(),
                                arguments: c.arguments.clone(),
                            },
                        })
                        .collect(),
                ),
                Content::ToolResult(result) => ("tool", result.output.clone(), Vec::new()),
                Content::Summary { text, .. } => (
                    "system",
                    format!("Summary of earlier conversation:\n{}", text),
                    Vec::new(),
                ),
                Content::Snippet { source, text } => (
                    "system",
                    format!("Reference [{}]:\n{}", source, text),
                    Vec::new(),
                ),
                Content::Text { text } => {
                    let role = match msg.role() {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                    };
                    (role, text.clone(), Vec::new())
                }
            };
            OllamaMessage {
                role: role.to_string(),
                content,
                tool_calls,
            }
        })
        .collect()
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OllamaTool> {
    tools
        .iter()
        .map(|t| OllamaTool {
            r#type: "function",
            function: t.clone(),
        })
        .collect()
}

/// Parse one NDJSON line. `next_index` numbers tool calls across the stream,
/// since each arrives whole and without an id.
fn parse_line(line: &str, next_index: &mut usize) -> Result<(Vec<Delta>, bool), BackendError> {
    let chunk: OllamaChunk = serde_json::from_str(line).map_err(|e| {
        BackendError::BackendUnavailable(format!("malformed stream line: {}", e))
    })?;
    if let Some(error) = chunk.error {
        return Err(BackendError::BackendUnavailable(error));
    }

    let mut deltas = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            deltas.push(Delta::Text(message.content));
        }
        for call in message.tool_calls {
            deltas.push(Delta::ToolCall(ToolCallFragment {
                index: *next_index,
                id: None,
                name: Some(call.function.name),
                arguments: call.function.arguments.to_string(),
            }));
            *next_index += 1;
        }
    }
    if chunk.done {
        let usage = match (chunk.prompt_eval_count, chunk.eval_count) {
            (None, None) => None,
            (prompt, completion) => Some(Usage {
                prompt_tokens: prompt.unwrap_or(0),
                completion_tokens: completion.unwrap_or(0),
            }),
        };
        deltas.push(Delta::Done(usage));
    }
    Ok((deltas, chunk.done))
}

async fn pump_ndjson(response: reqwest::Response, tx: DeltaSender) {
    let byte_stream = response.bytes_stream();
    tokio::pin!(byte_stream);
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut next_index = 0;

    loop {
        let chunk = tokio::select! {
            chunk = byte_stream.next() => chunk,
            _ = tx.closed() => {
                debug!("Local stream consumer went away; dropping connection");
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
            if line.is_empty() {
                continue;
            }
            match parse_line(&line, &mut next_index) {
                Ok((deltas, done)) => {
                    for delta in deltas {
                        if !tx.send(delta).await {
                            return;
                        }
                    }
                    if done {
                        return;
                    }
                }
                Err(err) => {
                    tx.send(Delta::Error(err)).await;
                    return;
                }
            }
        }
    }

    tx.send(Delta::Error(BackendError::BackendUnavailable(
        "stream ended without a done marker".to_string(),
    )))
    .await;
}

#[async_trait]
impl ModelClient for LocalClient {
    fn name(&self) -> &str {
        "local"
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
        let body = OllamaRequest {
            model: model.clone(),
            messages: convert_messages(&request.messages),
            tools: convert_tools(&request.tools),
            stream: true,
            options: OllamaOptions {
                temperature: request.options.temperature,
                num_predict: request.options.max_tokens,
            },
        };

        debug!(model = %model, messages = body.messages.len(), "Local request");

        let send = self
            .client
            .post(format!("{}/api/chat", self.api_base))
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
            let body = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or(text);
            return Err(classify_status(status.as_u16(), &body));
        }

        let (tx, stream) = delta_channel(cancel);
        tokio::spawn(pump_ndjson(response, tx));
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ToolResult;
    use serde_json::json;

    #[test]
    fn test_local_client_defaults() {
        let client = LocalClient::new(None, "");
        assert_eq!(client.api_base, OLLAMA_API_URL);
        assert_eq!(client.label(), format!("local:{}", DEFAULT_LOCAL_MODEL));

        let client = LocalClient::new(Some("http://gpu-box:11434/"), "qwen2.5");
        assert_eq!(client.api_base, "http://gpu-box:11434");
        assert_eq!(client.default_model(), "qwen2.5");
    }

    #[test]
    fn test_convert_messages_tool_round() {
        let call_msg = Message::assistant_with_tool_calls(
            "checking",
            vec![("c1".into(), "shell".into(), json!({"command": "ls"}))],
        );
        let call = call_msg.tool_calls()[0].clone();
        let converted = convert_messages(&[
            Message::user("what is here"),
            call_msg,
            Message::tool_result(ToolResult::ok(&call, "a.txt")),
        ]);
        assert_eq!(converted[1].role, "assistant");
        assert_eq!(converted[1].tool_calls[0].function.arguments["command"], "ls");
        assert_eq!(converted[2].role, "tool");
        assert_eq!(converted[2].content, "a.txt");
    }

    #[test]
    fn test_request_options_omitted_when_unset() {
        let body = OllamaRequest {
            model: "m".into(),
            messages: vec![],
            tools: vec![],
            stream: true,
            options: OllamaOptions::default(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("options").is_none());
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn test_parse_line_text_tools_and_done() {
        let mut next = 0;
        let (deltas, done) =
            parse_line(r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#, &mut next)
                .unwrap();
        assert_eq!(deltas, vec![Delta::Text("Hi".into())]);
        assert!(!done);

        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"list_files","arguments":{"path":"."}}}]},"done":false}"#;
        let (deltas, _) = parse_line(line, &mut next).unwrap();
        match &deltas[0] {
            Delta::ToolCall(fragment) => {
                assert_eq!(fragment.index, 0);
                assert_eq!(fragment.name.as_deref(), Some("list_files"));
                assert_eq!(fragment.arguments, "{\"path\":\".\"}");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(next, 1);

        let (deltas, done) =
            parse_line(r#"{"done":true,"prompt_eval_count":20,"eval_count":5}"#, &mut next)
                .unwrap();
        assert!(done);
        assert_eq!(
            deltas,
            vec![Delta::Done(Some(Usage {
                prompt_tokens: 20,
                completion_tokens: 5
            }))]
        );
    }

    #[test]
    fn test_parse_line_error() {
        let mut next = 0;
        let err = parse_line(r#"{"error":"model 'x' not found"}"#, &mut next).unwrap_err();
        assert_eq!(
            err,
            BackendError::BackendUnavailable("model 'x' not found".into())
        );
        assert!(parse_line("not json", &mut next).is_err());
    }
}
