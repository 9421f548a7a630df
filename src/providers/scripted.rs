//! Deterministic in-process backend.
//!
//! Plays back pre-scripted turns and records every request it receives. Used
//! by tests and local runs without a model server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

use super::{delta_channel, Delta, DeltaStream, GenerateRequest, ModelClient, ToolCallFragment};

/// Stable backend name.
pub const SCRIPTED_CLIENT_NAME: &str = "scripted";

/// One scripted model response, played back delta by delta.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedTurn {
    deltas: Vec<Delta>,
}

impl ScriptedTurn {
    /// Raw deltas, played back as given. Without a terminal delta the stream
    /// simply closes.
    pub fn deltas(deltas: Vec<Delta>) -> Self {
        Self { deltas }
    }

    /// A plain text reply streamed as one delta.
    pub fn text(text: &str) -> Self {
        Self::chunks(&[text])
    }

    /// A text reply streamed as one delta per chunk.
    pub fn chunks(chunks: &[&str]) -> Self {
        let mut deltas: Vec<Delta> = chunks.iter().map(|c| Delta::Text(c.to_string())).collect();
        deltas.push(Delta::Done(None));
        Self { deltas }
    }

    /// A single tool call without an id; the loop assigns a fresh one, so
    /// the turn can be replayed any number of times.
    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self::deltas(vec![
            Delta::ToolCall(ToolCallFragment {
                index: 0,
                id: None,
                name: Some(name.to_string()),
                arguments: arguments.to_string(),
            }),
            Delta::Done(None),
        ])
    }

    /// A single tool call with a fixed id.
    pub fn tool_call_with_id(id: &str, name: &str, arguments: Value) -> Self {
        Self::deltas(vec![
            Delta::ToolCall(ToolCallFragment {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: arguments.to_string(),
            }),
            Delta::Done(None),
        ])
    }
}

#[derive(Debug, Default)]
struct Script {
    failures: VecDeque<BackendError>,
    turns: VecDeque<ScriptedTurn>,
    last: Option<ScriptedTurn>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted model backend.
///
/// Each `generate` call first consumes a queued failure, if any, then the
/// next scripted turn. With `repeat_last`, the final turn is replayed once
/// the script runs out; otherwise an exhausted script is an
/// `InvalidRequest`.
#[derive(Debug)]
pub struct ScriptedClient {
    model: String,
    script: Mutex<Script>,
    repeat_last: bool,
    delta_delay: Option<Duration>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            model: "scripted-model".to_string(),
            script: Mutex::new(Script {
                turns: turns.into(),
                ..Default::default()
            }),
            repeat_last: false,
            delta_delay: None,
            attempts: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next unconsumed `generate` call with `error`. Calls queue up.
    pub fn fail_next(self, error: BackendError) -> Self {
        lock_unpoisoned(&self.script).failures.push_back(error);
        self
    }

    /// Replay the final turn once the script runs out.
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Pause before each delta.
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = Some(delay);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Time of every `generate` call, including failed ones.
    pub fn attempts(&self) -> Arc<Mutex<Vec<Instant>>> {
        Arc::clone(&self.attempts)
    }

    /// Every request that reached the script.
    pub fn requests(&self) -> Arc<Mutex<Vec<GenerateRequest>>> {
        Arc::clone(&self.requests)
    }

    fn next_turn(&self) -> Result<ScriptedTurn, BackendError> {
        let mut script = lock_unpoisoned(&self.script);
        if let Some(error) = script.failures.pop_front() {
            return Err(error);
        }
        match script.turns.pop_front() {
            Some(turn) => {
                script.last = Some(turn.clone());
                Ok(turn)
            }
            None => match (&script.last, self.repeat_last) {
                (Some(turn), true) => Ok(turn.clone()),
                _ => Err(BackendError::InvalidRequest(
                    "scripted backend has no turns left".to_string(),
                )),
            },
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn name(&self) -> &str {
        SCRIPTED_CLIENT_NAME
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream, BackendError> {
        lock_unpoisoned(&self.attempts).push(Instant::now());
        let turn = self.next_turn()?;
        lock_unpoisoned(&self.requests).push(request);

        let (tx, stream) = delta_channel(cancel);
        let delay = self.delta_delay;
        tokio::spawn(async move {
            for delta in turn.deltas {
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = tx.closed() => return,
                    }
                }
                if !tx.send(delta).await {
                    return;
                }
            }
        });
        Ok(stream)
    }
}
