//! Retry client - decorator that adds automatic retry with exponential backoff.
//!
//! Wraps any [`ModelClient`] and retries `generate` when the backend fails
//! with a retryable [`BackendError`] (rate limit, timeout, unavailable)
//! before the stream starts. Errors that arrive mid-stream are not retried:
//! deltas already consumed cannot be taken back.
//!
//! # Example
//!
//! ```rust,ignore
//! use termpal::providers::{RemoteClient, RetryClient};
//!
//! let inner = RemoteClient::new("api-key", "gpt-4o");
//! let client = RetryClient::new(Box::new(inner))
//!     .with_max_retries(5)
//!     .with_base_delay_ms(500);
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::BackendError;

use super::{DeltaStream, GenerateRequest, ModelClient};

/// A decorator client that retries transient backend errors with exponential backoff.
pub struct RetryClient {
    /// The wrapped client that performs actual requests.
    inner: Box<dyn ModelClient>,
    /// Maximum number of retries after the first attempt. Default: 3.
    max_retries: u32,
    /// Base delay in milliseconds for exponential backoff. Default: 1000.
    base_delay_ms: u64,
    /// Maximum delay cap in milliseconds. Default: 30000.
    max_delay_ms: u64,
}

impl std::fmt::Debug for RetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryClient")
            .field("inner", &self.inner.name())
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .finish()
    }
}

impl RetryClient {
    /// Wrap `inner` with the default settings (3 retries, 1s base, 30s cap).
    pub fn new(inner: Box<dyn ModelClient>) -> Self {
        Self {
            inner,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }

    /// Wrap `inner` with settings from configuration.
    pub fn from_config(inner: Box<dyn ModelClient>, config: &RetryConfig) -> Self {
        Self::new(inner)
            .with_max_retries(config.max_retries)
            .with_base_delay_ms(config.base_delay_ms)
            .with_max_delay_ms(config.max_delay_ms)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The delay before retry `n` (0-indexed) is
    /// `min(base_delay_ms * 2^n + jitter, max_delay_ms)` with `jitter < base_delay_ms`.
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

/// Compute the backoff delay for a given retry (without sleeping).
///
/// Because `jitter_ms < base_delay_ms`, the delay for retry `n + 1` is never
/// shorter than the delay for retry `n`.
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

/// Jitter in `0..base_delay_ms`, taken from the clock's nanosecond component.
fn jitter(base_delay_ms: u64) -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % base_delay_ms.max(1))
        .unwrap_or(0)
}

#[async_trait]
impl ModelClient for RetryClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    fn label(&self) -> String {
        self.inner.label()
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, BackendError> {
        let mut attempt: u32 = 0;
        loop {
            match self.inner.generate(request.clone(), cancel).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.max_retries {
                        return Err(err);
                    }
                    let delay = compute_delay(
                        attempt,
                        self.base_delay_ms,
                        self.max_delay_ms,
                        jitter(self.base_delay_ms),
                    );
                    warn!(
                        backend = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay,
                        error_kind = err.kind(),
                        error = %err,
                        "Retrying generation after transient error"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = cancel.cancelled() => return Err(err),
                    }
                    attempt += 1;
                }
            }
        }
    }
}
