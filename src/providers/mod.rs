//! Providers module - model backends
//!
//! This module defines the [`ModelClient`] trait and the streaming delta
//! protocol shared by every backend, plus the backend variants:
//!
//! - [`RemoteClient`]: OpenAI-compatible chat completions over SSE
//! - [`LocalClient`]: Ollama-style `/api/chat` over NDJSON
//! - [`ScriptedClient`]: deterministic in-process playback
//! - [`RetryClient`]: decorator retrying transient failures
//!
//! # Example
//!
//! ```rust
//! use termpal::providers::{Delta, GenerateRequest, ModelClient, ScriptedClient, ScriptedTurn};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let client = ScriptedClient::new(vec![ScriptedTurn::chunks(&["Hello", " there"])]);
//! let mut stream = client
//!     .generate(GenerateRequest::default(), &CancellationToken::new())
//!     .await
//!     .unwrap();
//!
//! let mut text = String::new();
//! while let Some(delta) = stream.recv().await {
//!     match delta {
//!         Delta::Text(t) => text.push_str(&t),
//!         Delta::Done(_) => break,
//!         _ => {}
//!     }
//! }
//! assert_eq!(text, "Hello there");
//! # });
//! ```

pub mod local;
pub mod remote;
pub mod retry;
pub mod scripted;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{BackendKind, Config};
use crate::error::{BackendError, Result, TermpalError};

pub use local::LocalClient;
pub use remote::RemoteClient;
pub use retry::RetryClient;
pub use scripted::{ScriptedClient, ScriptedTurn};
pub use types::{
    delta_channel, AssembledCall, Delta, DeltaSender, DeltaStream, GenerateOptions,
    GenerateRequest, ModelClient, ToolCallAssembler, ToolCallFragment, ToolDefinition, Usage,
};

/// Map an HTTP status code and response body onto a [`BackendError`].
///
/// Both HTTP backends use this so every variant classifies failures the
/// same way.
pub fn classify_status(status: u16, body: &str) -> BackendError {
    let message = format!("HTTP {}: {}", status, body);
    match status {
        429 => BackendError::RateLimited(message),
        408 | 504 => BackendError::Timeout(message),
        400..=499 => BackendError::InvalidRequest(message),
        _ => BackendError::BackendUnavailable(message),
    }
}

/// Map a transport failure onto a [`BackendError`].
pub fn classify_transport(err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), &err.to_string())
    } else if err.is_builder() {
        BackendError::InvalidRequest(err.to_string())
    } else {
        BackendError::BackendUnavailable(err.to_string())
    }
}

/// Remove every complete line from `buffer` and return them decoded and
/// trimmed. A trailing partial line stays in the buffer as raw bytes, so a
/// character split between two network chunks is decoded whole.
pub(crate) fn take_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line).trim().to_string());
    }
    lines
}

/// Longest wait for a connection to a backend.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for streamed responses. `idle` bounds each wait for data, not
/// the whole response, so a long generation that keeps streaming is never
/// cut off.
pub(crate) fn streaming_http_client(
    idle: Duration,
) -> std::result::Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(idle))
        .read_timeout(idle)
        .build()
        .map_err(|e| BackendError::InvalidRequest(format!("HTTP client setup: {}", e)))
}

/// Build the configured backend, wrapped in a [`RetryClient`] when retries
/// are enabled.
pub fn build_client(config: &Config) -> Result<Arc<dyn ModelClient>> {
    let timeout = Duration::from_secs(config.backend.request_timeout_secs.unwrap_or(120));
    let model = config.agent.model.as_str();

    let client: Box<dyn ModelClient> = match config.backend.kind {
        BackendKind::Remote => {
            let api_key = config.backend.api_key.as_deref().ok_or_else(|| {
                TermpalError::Config("backend.api_key is required for the remote backend".into())
            })?;
            let api_base = config
                .backend
                .api_base
                .as_deref()
                .unwrap_or(remote::OPENAI_API_URL);
            Box::new(RemoteClient::with_timeout(api_key, api_base, model, timeout)?)
        }
        BackendKind::Local => Box::new(LocalClient::with_timeout(
            config.backend.api_base.as_deref(),
            model,
            timeout,
        )?),
    };

    info!(backend = %client.label(), retry = config.retry.enabled, "Model backend ready");
    if config.retry.enabled {
        Ok(Arc::new(RetryClient::from_config(client, &config.retry)))
    } else {
        Ok(Arc::from(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(429, "slow down"),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(classify_status(408, ""), BackendError::Timeout(_)));
        assert!(matches!(classify_status(504, ""), BackendError::Timeout(_)));
        assert!(matches!(
            classify_status(401, "bad key"),
            BackendError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(404, "no model"),
            BackendError::InvalidRequest(_)
        ));
        assert!(matches!(
            classify_status(500, ""),
            BackendError::BackendUnavailable(_)
        ));
        assert!(matches!(
            classify_status(503, ""),
            BackendError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn test_classify_status_keeps_body() {
        let err = classify_status(400, "model 'x' does not exist");
        assert_eq!(err.to_string(), "Invalid request: HTTP 400: model 'x' does not exist");
    }

    #[test]
    fn test_take_lines_keeps_partial_tail() {
        let mut buffer = b"data: one\r\n\ndata: tw".to_vec();
        assert_eq!(take_lines(&mut buffer), vec!["data: one", ""]);
        assert_eq!(buffer, b"data: tw");
        buffer.extend_from_slice(b"o\n");
        assert_eq!(take_lines(&mut buffer), vec!["data: two"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_lines_joins_characters_split_across_chunks() {
        let line = "data: 你好\n".as_bytes();
        // Split inside the first character.
        let split = "data: ".len() + 1;
        let mut buffer = line[..split].to_vec();
        assert!(take_lines(&mut buffer).is_empty());
        buffer.extend_from_slice(&line[split..]);
        assert_eq!(take_lines(&mut buffer), vec!["data: 你好"]);
    }

    #[test]
    fn test_build_client_variants() {
        let mut config = Config::default();
        config.backend.kind = BackendKind::Local;
        config.agent.model = "llama3".into();
        let client = build_client(&config).unwrap();
        assert_eq!(client.label(), "local:llama3");

        config.backend.kind = BackendKind::Remote;
        config.backend.api_key = None;
        assert!(matches!(
            build_client(&config),
            Err(TermpalError::Config(_))
        ));

        config.backend.api_key = Some("sk-test".into());
        config.retry.enabled = false;
        assert_eq!(build_client(&config).unwrap().name(), "remote");
    }
}
