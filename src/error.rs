//! Error types for termpal
//!
//! This module defines the error taxonomy used throughout the crate. Uses
//! `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! Only [`TermpalError::Storage`] and [`TermpalError::Config`] are fatal; every
//! other variant leaves the conversation alive and is reported to the user.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Backend Error Classification
// ============================================================================

/// Normalized model backend failure.
///
/// Every backend variant maps its transport and HTTP failures onto one of
/// these four kinds so the retry decorator and the agent loop never need to
/// look at provider-specific error strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// 429: rate limit or quota exceeded
    RateLimited(String),
    /// Connection, read, or gateway timeout
    Timeout(String),
    /// 4xx other than 408/429: malformed request, auth failure, unknown model
    InvalidRequest(String),
    /// 5xx, refused connection, or a stream that ended without an end marker
    BackendUnavailable(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            BackendError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            BackendError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            BackendError::BackendUnavailable(msg) => write!(f, "Backend unavailable: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    /// Returns `true` if this error is transient and the request should be retried.
    ///
    /// Retryable errors: RateLimited, Timeout, BackendUnavailable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::InvalidRequest(_))
    }

    /// Short stable label, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::RateLimited(_) => "rate_limited",
            BackendError::Timeout(_) => "timeout",
            BackendError::InvalidRequest(_) => "invalid_request",
            BackendError::BackendUnavailable(_) => "backend_unavailable",
        }
    }
}

impl From<BackendError> for TermpalError {
    fn from(err: BackendError) -> Self {
        TermpalError::Backend(err)
    }
}

// ============================================================================
// Tool Error Classification
// ============================================================================

/// Why a tool call did not produce an `ok` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// No tool with the requested name is registered
    UnknownTool,
    /// Arguments do not match the tool's schema
    ArgumentValidation,
    /// The tool ran past its wall-clock timeout
    ExecutionTimeout,
    /// The tool ran and reported a failure
    ExecutionFailed,
    /// The confirmation gate refused a destructive tool
    Denied,
    /// The turn was cancelled before or while the tool ran
    Cancelled,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolErrorKind::UnknownTool => "unknown tool",
            ToolErrorKind::ArgumentValidation => "argument validation failed",
            ToolErrorKind::ExecutionTimeout => "execution timed out",
            ToolErrorKind::ExecutionFailed => "execution failed",
            ToolErrorKind::Denied => "denied by confirmation gate",
            ToolErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for termpal operations.
#[derive(Error, Debug)]
pub enum TermpalError {
    /// Malformed user input or a request the current state cannot serve
    #[error("User error: {0}")]
    User(String),

    /// Tool failure that escaped the executor (handlers return this; the
    /// executor turns it into a `ToolResult`)
    #[error("Tool error ({kind}): {message}")]
    Tool { kind: ToolErrorKind, message: String },

    /// Normalized backend failure, after retries
    #[error("Backend error: {0}")]
    Backend(BackendError),

    /// Conversation log append/load failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or tool registration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The per-turn tool-call recursion limit was hit
    #[error("Tool-call depth limit of {max} reached for this turn")]
    ToolDepthExceeded { max: usize },

    /// The operation observed a cancellation request
    #[error("Cancelled")]
    Cancelled,

    /// Security violations (path traversal attempts, blocked commands, etc.)
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TermpalError {
    /// Returns `true` when the affected conversation (or the whole process,
    /// for configuration) must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TermpalError::Storage(_) | TermpalError::Config(_))
    }

    /// Shorthand for a tool failure with `ExecutionFailed` kind.
    pub fn tool_failed(message: impl Into<String>) -> Self {
        TermpalError::Tool {
            kind: ToolErrorKind::ExecutionFailed,
            message: message.into(),
        }
    }
}

/// A specialized `Result` type for termpal operations.
pub type Result<T> = std::result::Result<T, TermpalError>;
