//! Agent loop implementation
//!
//! [`AgentLoop`] owns one conversation. Each call to [`AgentLoop::step`]
//! records the user's message, then alternates between asking the model
//! for a response and executing the tool calls it requests, until the model
//! answers with plain text, the turn is cancelled, or the tool-call depth
//! limit is reached.
//!
//! Every message is written to the [`ConversationStore`] before it is added
//! to the in-memory conversation, so a crash never leaves the memory ahead
//! of the log. A new conversation reaches the store with its first message,
//! so a session that never got any input leaves nothing behind.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{AgentConfig, Config, ConfirmationPolicy};
use crate::conversation::{Conversation, ConversationStore, Message, Role, ToolCall, ToolResult};
use crate::error::{BackendError, Result, TermpalError, ToolErrorKind};
use crate::providers::{
    Delta, DeltaStream, GenerateOptions, GenerateRequest, ModelClient, ToolCallAssembler,
};
use crate::retrieval::RetrievalAugmenter;
use crate::tools::{ExecutionPolicy, ToolExecutor, ToolRegistry};

use super::codeblocks;
use super::compaction::ExtractiveSummarizer;
use super::context::ContextWindowManager;
use super::prompt::{PromptBuilder, RuntimeContext};

/// Events in flight per turn. Each one is also acknowledged on receipt, so
/// the turn never runs ahead of what the caller has seen.
const EVENT_CHANNEL_CAPACITY: usize = 1;

/// Where the loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Idle, ready for the next user message
    AwaitingUserInput,
    /// Streaming a model response
    GeneratingResponse,
    /// Running tool calls requested by the model
    ExecutingTool,
    /// Closed by the user; no further turns
    Completed,
    /// Stopped after a fatal error; no further turns
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Completed | LoopState::Failed)
    }
}

/// How a turn ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model answered without requesting tools
    Completed,
    /// The caller cancelled the turn
    Cancelled,
}

/// Progress of a running turn, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Text streamed from the model
    Delta(String),
    /// A tool call about to run
    ToolCall(ToolCall),
    /// The result of a finished tool call
    ToolResult(ToolResult),
}

/// Loop settings taken from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    /// Tool-execution rounds allowed within one turn
    pub max_tool_depth: usize,
    pub tool_timeout: Duration,
    pub options: GenerateOptions,
    /// Run fenced shell/python blocks when the model makes no structured calls
    pub codeblock_tools: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

impl AgentSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut options = GenerateOptions::new()
            .with_max_tokens(config.max_tokens)
            .with_temperature(config.temperature);
        if !config.model.is_empty() {
            options = options.with_model(config.model.clone());
        }
        Self {
            max_tool_depth: config.max_tool_depth,
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
            options,
            codeblock_tools: config.codeblock_tools,
        }
    }
}

/// Handle to a running turn.
///
/// Yields [`TurnEvent`]s as a [`Stream`]. Dropping the handle cancels the
/// turn; [`TurnHandle::finish`] waits for it to end.
pub struct TurnHandle {
    events: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
    task: JoinHandle<Result<TurnOutcome>>,
    guard: DropGuard,
}

impl TurnHandle {
    /// Ask the turn to stop. Partial output is kept as an incomplete message.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this turn, e.g. for a Ctrl-C handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next event, or `None` once the turn has ended.
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await.map(Envelope::open)
    }

    /// Wait for the turn to end. Unread events are discarded.
    pub async fn finish(self) -> Result<TurnOutcome> {
        let TurnHandle {
            events,
            task,
            guard,
            ..
        } = self;
        drop(events);
        let joined = task.await;
        guard.disarm();
        joined.map_err(|e| {
            TermpalError::Io(std::io::Error::other(format!("turn task failed: {}", e)))
        })?
    }
}

impl Stream for TurnHandle {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        self.events.poll_recv(cx).map(|event| event.map(Envelope::open))
    }
}

/// An event plus the acknowledgement fired when the caller receives it.
struct Envelope {
    event: TurnEvent,
    ack: oneshot::Sender<()>,
}

impl Envelope {
    fn open(self) -> TurnEvent {
        let _ = self.ack.send(());
        self.event
    }
}

/// Sending half of a turn's event channel.
struct Events {
    tx: mpsc::Sender<Envelope>,
}

impl Events {
    /// Deliver `event` and wait until the caller has received it.
    ///
    /// Returns `false` when the turn was cancelled before the caller took
    /// the event. A caller that stopped listening counts as having seen
    /// everything, so a turn awaited with [`TurnHandle::finish`] alone still
    /// completes.
    async fn emit(&self, event: TurnEvent, cancel: &CancellationToken) -> bool {
        let (ack, received) = oneshot::channel();
        let envelope = Envelope { event, ack };
        tokio::select! {
            biased;
            sent = self.tx.send(envelope) => {
                if sent.is_err() {
                    return true;
                }
            }
            _ = cancel.cancelled() => return false,
        }
        tokio::select! {
            biased;
            // An unread event dropped with the receiver also resolves here.
            _ = received => true,
            _ = cancel.cancelled() => false,
        }
    }
}

/// How a model response stream ended.
enum StreamEnd {
    Done,
    Cancelled,
    Failed(BackendError),
}

struct Generation {
    text: String,
    assembler: ToolCallAssembler,
    end: StreamEnd,
}

/// Clears the in-flight flag when the turn task ends, however it ends.
struct InFlightGuard {
    inner: Arc<Inner>,
}

impl InFlightGuard {
    fn acquire(inner: &Arc<Inner>) -> Result<Self> {
        inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TermpalError::User("turn in progress".to_string()))?;
        Ok(Self {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.store(false, Ordering::Release);
    }
}

struct Inner {
    conversation_id: String,
    client: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    store: Arc<ConversationStore>,
    window: ContextWindowManager,
    augmenter: Option<RetrievalAugmenter>,
    settings: AgentSettings,
    conversation: Mutex<Conversation>,
    state: std::sync::Mutex<LoopState>,
    confirmation: std::sync::Mutex<ConfirmationPolicy>,
    in_flight: AtomicBool,
    /// Whether the log exists yet
    stored: AtomicBool,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fresh_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

impl Inner {
    fn state(&self) -> LoopState {
        *lock(&self.state)
    }

    /// Move to `next` unless the loop has already stopped.
    fn transition(&self, next: LoopState) {
        let mut state = lock(&self.state);
        if !state.is_terminal() {
            *state = next;
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            LoopState::Completed => Err(TermpalError::User("conversation is closed".to_string())),
            LoopState::Failed => Err(TermpalError::User(
                "conversation stopped after a storage failure".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Write `message` to the log, then to memory. The log is created on
    /// the first write.
    async fn persist(&self, conversation: &mut Conversation, message: Message) -> Result<()> {
        conversation.check_append(&message)?;
        if !self.stored.load(Ordering::Acquire) {
            self.store.create(conversation).await?;
            self.stored.store(true, Ordering::Release);
            info!(
                conversation = %conversation.id(),
                backend = %self.client.label(),
                "Conversation created"
            );
        }
        self.store.append(conversation.id(), &message).await?;
        conversation.push(message)
    }

    /// Answer tool calls left without a result by an interrupted process.
    async fn close_interrupted_calls(&self) -> Result<()> {
        let mut conversation = self.conversation.lock().await;
        let pending: Vec<ToolCall> = conversation
            .unanswered_tool_calls()
            .into_iter()
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        warn!(
            conversation = %self.conversation_id,
            count = pending.len(),
            "Closing tool calls interrupted before a result was recorded"
        );
        for call in &pending {
            let result = ToolResult::error(
                call,
                ToolErrorKind::Cancelled,
                "Interrupted before a result was recorded",
            );
            self.persist(&mut conversation, Message::tool_result(result))
                .await?;
        }
        Ok(())
    }

    async fn run_turn(
        &self,
        input: Option<String>,
        policy: ExecutionPolicy,
        cancel: CancellationToken,
        events: Events,
    ) -> Result<TurnOutcome> {
        let mut conversation = self.conversation.lock().await;
        let result = self
            .drive(&mut conversation, input, &policy, &cancel, &events)
            .await;
        match &result {
            Ok(outcome) => {
                info!(outcome = ?outcome, messages = conversation.len(), "Turn finished");
                self.transition(LoopState::AwaitingUserInput);
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Turn failed; conversation stopped");
                self.transition(LoopState::Failed);
            }
            Err(e) => {
                warn!(error = %e, "Turn ended with an error");
                self.transition(LoopState::AwaitingUserInput);
            }
        }
        result
    }

    async fn drive(
        &self,
        conversation: &mut Conversation,
        input: Option<String>,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
        events: &Events,
    ) -> Result<TurnOutcome> {
        if let Some(text) = input {
            self.persist(conversation, Message::user(&text)).await?;
        }

        let candidates = match (&self.augmenter, conversation.last_user_index()) {
            (Some(augmenter), Some(i)) => {
                augmenter.candidates(&conversation.messages()[i]).await
            }
            _ => Vec::new(),
        };
        let tools = self.executor.registry().definitions();
        let mut rounds = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }

            self.transition(LoopState::GeneratingResponse);
            let window = self.window.build(conversation, &candidates);
            debug!(
                round = rounds,
                messages = window.messages.len(),
                tokens = window.total_tokens,
                summarized = window.has_summary(),
                "Context window built"
            );
            let request = GenerateRequest {
                messages: window.messages,
                tools: tools.clone(),
                options: self.settings.options.clone(),
            };

            let stream = match self.client.generate(request, cancel).await {
                Ok(stream) => stream,
                Err(_) if cancel.is_cancelled() => return Ok(TurnOutcome::Cancelled),
                Err(e) => return Err(e.into()),
            };
            let Generation {
                text,
                assembler,
                end,
            } = self.consume(stream, cancel, events).await;

            match end {
                StreamEnd::Done if !cancel.is_cancelled() => {}
                StreamEnd::Done | StreamEnd::Cancelled => {
                    if !text.is_empty() {
                        self.persist(conversation, Message::assistant_incomplete(&text))
                            .await?;
                    }
                    return Ok(TurnOutcome::Cancelled);
                }
                StreamEnd::Failed(e) => {
                    if !text.is_empty() {
                        self.persist(conversation, Message::assistant_incomplete(&text))
                            .await?;
                    }
                    return Err(e.into());
                }
            }

            let planned = self.plan_calls(conversation, &text, assembler);
            if planned.is_empty() {
                self.persist(conversation, Message::assistant(&text)).await?;
                return Ok(TurnOutcome::Completed);
            }

            let message = Message::assistant_with_tool_calls(&text, planned);
            let calls = message.tool_calls().to_vec();
            self.persist(conversation, message).await?;

            if rounds >= self.settings.max_tool_depth {
                let max = self.settings.max_tool_depth;
                warn!(max, "Tool-call depth limit reached");
                for call in &calls {
                    let result = ToolResult::error(
                        call,
                        ToolErrorKind::ExecutionFailed,
                        "tool-call depth limit reached",
                    );
                    self.persist(conversation, Message::tool_result(result)).await?;
                }
                return Err(TermpalError::ToolDepthExceeded { max });
            }
            rounds += 1;

            self.transition(LoopState::ExecutingTool);
            for call in &calls {
                events.emit(TurnEvent::ToolCall(call.clone()), cancel).await;
                let result = self.executor.execute(call, policy, cancel).await;
                self.persist(conversation, Message::tool_result(result.clone()))
                    .await?;
                events.emit(TurnEvent::ToolResult(result), cancel).await;
            }
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
        }
    }

    /// Read a response stream to its end, forwarding text as it arrives.
    ///
    /// Only text the caller has received is kept, so a cancelled turn
    /// records exactly what was shown.
    async fn consume(
        &self,
        mut stream: DeltaStream,
        cancel: &CancellationToken,
        events: &Events,
    ) -> Generation {
        let mut text = String::new();
        let mut assembler = ToolCallAssembler::new();
        let end = loop {
            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                delta = stream.recv() => delta,
            };
            match delta {
                Some(Delta::Text(chunk)) => {
                    if !events.emit(TurnEvent::Delta(chunk.clone()), cancel).await {
                        break StreamEnd::Cancelled;
                    }
                    text.push_str(&chunk);
                }
                Some(Delta::ToolCall(fragment)) => assembler.push(fragment),
                Some(Delta::Done(usage)) => {
                    if let Some(usage) = usage {
                        debug!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Generation finished"
                        );
                    }
                    break StreamEnd::Done;
                }
                Some(Delta::Error(e)) => {
                    warn!(kind = e.kind(), error = %e, "Response stream failed");
                    break StreamEnd::Failed(e);
                }
                None => {
                    break StreamEnd::Failed(BackendError::BackendUnavailable(
                        "response stream closed without an end marker".to_string(),
                    ))
                }
            }
        };
        Generation {
            text,
            assembler,
            end,
        }
    }

    /// Tool calls to run for a completed response, with ids unique within
    /// the conversation.
    fn plan_calls(
        &self,
        conversation: &Conversation,
        text: &str,
        assembler: ToolCallAssembler,
    ) -> Vec<(String, String, Value)> {
        let mut planned: Vec<(String, String, Value)> = assembler
            .finish()
            .into_iter()
            .map(|call| (call.id, call.name, call.arguments))
            .collect();

        if planned.is_empty() && self.settings.codeblock_tools {
            let registry = self.executor.registry();
            planned = codeblocks::extract_tool_calls(text)
                .into_iter()
                .filter(|(name, _)| registry.has(name))
                .map(|(name, args)| (fresh_call_id(), name, args))
                .collect();
            if !planned.is_empty() {
                debug!(count = planned.len(), "Running fenced code blocks as tool calls");
            }
        }

        let mut seen: HashSet<String> = conversation
            .messages()
            .iter()
            .flat_map(|m| m.tool_calls())
            .map(|c| c.id.clone())
            .collect();
        for (id, name, _) in planned.iter_mut() {
            if !seen.insert(id.clone()) {
                let replacement = fresh_call_id();
                debug!(tool = %name, old = %id, new = %replacement, "Replacing duplicate tool call id");
                *id = replacement.clone();
                seen.insert(replacement);
            }
        }
        planned
    }
}

/// Assembles an [`AgentLoop`] and opens its conversation.
pub struct AgentLoopBuilder {
    client: Arc<dyn ModelClient>,
    executor: ToolExecutor,
    store: Arc<ConversationStore>,
    settings: AgentSettings,
    window: ContextWindowManager,
    augmenter: Option<RetrievalAugmenter>,
    prompt: PromptBuilder,
    confirmation: ConfirmationPolicy,
}

impl AgentLoopBuilder {
    /// Apply agent, tool and retrieval settings from `config`.
    pub fn configure(mut self, config: &Config) -> Self {
        self.settings = AgentSettings::from_config(&config.agent);
        let mut window = ContextWindowManager::new(config.agent.context_budget)
            .with_precedence(config.retrieval.precedence);
        if config.agent.summarize_dropped {
            window = window.with_summarizer(Arc::new(ExtractiveSummarizer::default()));
        }
        self.window = window;
        self.confirmation = config.tools.confirmation;

        let runtime = RuntimeContext::new()
            .with_workspace(&config.workspace_path().to_string_lossy())
            .with_os_info()
            .with_current_date();
        self.prompt = PromptBuilder::new()
            .with_system_prompt(&config.agent.system_prompt)
            .with_runtime_context(runtime);
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn context_manager(mut self, window: ContextWindowManager) -> Self {
        self.window = window;
        self
    }

    pub fn augmenter(mut self, augmenter: RetrievalAugmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    pub fn prompt(mut self, prompt: PromptBuilder) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn confirmation(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation = policy;
        self
    }

    /// Start a new conversation with a generated id. Its log is written with
    /// the first message.
    pub async fn create(self) -> Result<AgentLoop> {
        let conversation = Conversation::new(&self.client.label());
        self.open_new(conversation).await
    }

    /// Start a new conversation with the given id.
    pub async fn create_with_id(self, id: &str) -> Result<AgentLoop> {
        if self.store.exists(id).await {
            return Err(TermpalError::User(format!(
                "conversation '{}' already exists",
                id
            )));
        }
        let conversation = Conversation::with_id(id, &self.client.label());
        self.open_new(conversation).await
    }

    /// Continue a stored conversation.
    pub async fn resume(self, id: &str) -> Result<AgentLoop> {
        let conversation = self.store.load(id).await?;
        info!(
            conversation = %id,
            messages = conversation.len(),
            backend = %conversation.meta().backend_used,
            "Conversation resumed"
        );
        let agent = self.into_loop(conversation, true);
        agent.inner.close_interrupted_calls().await?;
        Ok(agent)
    }

    async fn open_new(self, mut conversation: Conversation) -> Result<AgentLoop> {
        let system = self
            .prompt
            .clone()
            .with_tools(self.executor.registry())
            .build_message();
        conversation.push(system)?;
        debug!(
            conversation = %conversation.id(),
            tools = self.executor.registry().len(),
            "Conversation opened"
        );
        Ok(self.into_loop(conversation, false))
    }

    fn into_loop(self, conversation: Conversation, stored: bool) -> AgentLoop {
        AgentLoop {
            inner: Arc::new(Inner {
                conversation_id: conversation.id().to_string(),
                client: self.client,
                executor: self.executor,
                store: self.store,
                window: self.window,
                augmenter: self.augmenter,
                settings: self.settings,
                conversation: Mutex::new(conversation),
                state: std::sync::Mutex::new(LoopState::AwaitingUserInput),
                confirmation: std::sync::Mutex::new(self.confirmation),
                in_flight: AtomicBool::new(false),
                stored: AtomicBool::new(stored),
            }),
        }
    }
}

/// Drives one conversation turn by turn.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use termpal::agent::{AgentLoop, TurnOutcome};
/// use termpal::conversation::ConversationStore;
/// use termpal::providers::{ScriptedClient, ScriptedTurn};
/// use termpal::tools::{ToolExecutor, ToolRegistry};
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
/// let client = Arc::new(ScriptedClient::new(vec![ScriptedTurn::text("Hi!")]));
/// let executor = ToolExecutor::new(ToolRegistry::empty());
///
/// let agent = AgentLoop::builder(client, executor, store).create().await.unwrap();
/// let turn = agent.step("Hello").unwrap();
/// assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Completed);
/// assert_eq!(agent.snapshot().await.last().unwrap().text(), "Hi!");
/// # });
/// ```
#[derive(Clone)]
pub struct AgentLoop {
    inner: Arc<Inner>,
}

impl AgentLoop {
    pub fn builder(
        client: Arc<dyn ModelClient>,
        executor: ToolExecutor,
        store: Arc<ConversationStore>,
    ) -> AgentLoopBuilder {
        AgentLoopBuilder {
            client,
            executor,
            store,
            settings: AgentSettings::default(),
            window: ContextWindowManager::new(AgentConfig::default().context_budget),
            augmenter: None,
            prompt: PromptBuilder::new(),
            confirmation: ConfirmationPolicy::default(),
        }
    }

    /// Start a turn for `input`.
    ///
    /// Fails immediately when the input is blank, another turn is still
    /// running, or the conversation is closed. Everything after that is
    /// reported through the returned handle.
    pub fn step(&self, input: &str) -> Result<TurnHandle> {
        if input.trim().is_empty() {
            return Err(TermpalError::User("empty input".to_string()));
        }
        self.start_turn(Some(input.to_string()))
    }

    /// Answer a trailing user message that never got a response, e.g. after
    /// resuming a conversation that was interrupted mid-turn.
    pub async fn resume_pending(&self) -> Result<Option<TurnHandle>> {
        self.inner.check_open()?;
        if self.inner.in_flight.load(Ordering::Acquire) {
            return Err(TermpalError::User("turn in progress".to_string()));
        }
        let pending = {
            let conversation = self.inner.conversation.lock().await;
            conversation
                .last()
                .map(|m| m.role() == Role::User)
                .unwrap_or(false)
        };
        if pending {
            self.start_turn(None).map(Some)
        } else {
            Ok(None)
        }
    }

    fn start_turn(&self, input: Option<String>) -> Result<TurnHandle> {
        self.inner.check_open()?;
        let in_flight = InFlightGuard::acquire(&self.inner)?;

        let policy = ExecutionPolicy {
            confirmation: self.confirmation(),
            timeout: self.inner.settings.tool_timeout,
        };
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let span = info_span!(
            "turn",
            conversation = %self.inner.conversation_id,
            backend = %self.inner.client.label(),
        );
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(
            async move {
                let _in_flight = in_flight;
                inner.run_turn(input, policy, token, Events { tx }).await
            }
            .instrument(span),
        );

        Ok(TurnHandle {
            events: rx,
            guard: cancel.clone().drop_guard(),
            cancel,
            task,
        })
    }

    /// Add `text` as a user message without asking the model for a reply.
    /// The next turn sees it as context.
    pub async fn add_user_message(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(TermpalError::User("empty input".to_string()));
        }
        self.inner.check_open()?;
        let _in_flight = InFlightGuard::acquire(&self.inner)?;
        let mut conversation = self.inner.conversation.lock().await;
        let result = self
            .inner
            .persist(&mut conversation, Message::user(text))
            .await;
        if let Err(ref e) = result {
            if e.is_fatal() {
                error!(error = %e, "Could not record message; conversation stopped");
                self.inner.transition(LoopState::Failed);
            }
        }
        result
    }

    /// Stop accepting turns. A running turn is left to finish.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        if !state.is_terminal() {
            *state = LoopState::Completed;
            info!(conversation = %self.inner.conversation_id, "Conversation closed");
        }
    }

    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn backend_label(&self) -> String {
        self.inner.client.label()
    }

    pub fn registry(&self) -> &ToolRegistry {
        self.inner.executor.registry()
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.inner.executor
    }

    pub fn confirmation(&self) -> ConfirmationPolicy {
        *lock(&self.inner.confirmation)
    }

    /// Change the confirmation policy. A running turn keeps the policy it
    /// started with.
    pub fn set_confirmation(&self, policy: ConfirmationPolicy) {
        *lock(&self.inner.confirmation) = policy;
    }

    /// Copy of the conversation. Waits for a running turn to finish.
    pub async fn snapshot(&self) -> Conversation {
        self.inner.conversation.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Content, MessageStatus, ToolStatus};
    use crate::providers::{ScriptedClient, ScriptedTurn};
    use crate::tools::{EchoTool, ToolRegistryBuilder};
    use futures::StreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<ConversationStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
        (dir, store)
    }

    fn echo_executor() -> ToolExecutor {
        ToolExecutor::new(ToolRegistryBuilder::new().register(EchoTool).unwrap().build())
    }

    async fn agent_with(
        client: ScriptedClient,
        settings: AgentSettings,
    ) -> (TempDir, Arc<ConversationStore>, AgentLoop) {
        let (dir, store) = store();
        let agent = AgentLoop::builder(Arc::new(client), echo_executor(), Arc::clone(&store))
            .settings(settings)
            .create()
            .await
            .unwrap();
        (dir, store, agent)
    }

    #[tokio::test]
    async fn test_plain_answer_streams_and_persists() {
        let client = ScriptedClient::new(vec![ScriptedTurn::chunks(&["Hel", "lo"])]);
        let (_dir, store, agent) = agent_with(client, AgentSettings::default()).await;

        let mut turn = agent.step("hi").unwrap();
        let mut streamed = String::new();
        while let Some(event) = turn.next().await {
            if let TurnEvent::Delta(text) = event {
                streamed.push_str(&text);
            }
        }
        assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Completed);
        assert_eq!(streamed, "Hello");
        assert_eq!(agent.state(), LoopState::AwaitingUserInput);

        let conv = agent.snapshot().await;
        let roles: Vec<Role> = conv.messages().iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(conv.last().unwrap().text(), "Hello");

        let loaded = store.load(agent.conversation_id()).await.unwrap();
        assert_eq!(loaded.messages(), conv.messages());
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let client = ScriptedClient::new(vec![
            ScriptedTurn::tool_call_with_id("c1", "echo", json!({"message": "ping"})),
            ScriptedTurn::text("got ping"),
        ]);
        let requests = client.requests();
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;

        let mut turn = agent.step("echo ping").unwrap();
        let mut events = Vec::new();
        while let Some(event) = turn.next().await {
            events.push(event);
        }
        assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Completed);

        assert!(matches!(&events[0], TurnEvent::ToolCall(c) if c.tool_name == "echo"));
        assert!(matches!(&events[1], TurnEvent::ToolResult(r) if r.output == "ping"));

        let conv = agent.snapshot().await;
        let result = conv.messages()[3].as_tool_result().unwrap();
        assert_eq!(result.tool_call_id, "c1");
        assert_eq!(result.status, ToolStatus::Ok);
        assert_eq!(conv.last().unwrap().text(), "got ping");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].tools.iter().any(|t| t.name == "echo"));
        let second = &requests[1].messages;
        assert!(second.iter().any(|m| m.as_tool_result().is_some()));
    }

    #[tokio::test]
    async fn test_depth_limit_ends_turn_with_error_results() {
        let client = ScriptedClient::new(vec![ScriptedTurn::tool_call(
            "echo",
            json!({"message": "again"}),
        )])
        .repeat_last();
        let settings = AgentSettings {
            max_tool_depth: 2,
            ..AgentSettings::default()
        };
        let (_dir, _store, agent) = agent_with(client, settings).await;

        let err = agent.step("loop").unwrap().finish().await.unwrap_err();
        assert!(matches!(err, TermpalError::ToolDepthExceeded { max: 2 }));
        assert_eq!(agent.state(), LoopState::AwaitingUserInput);

        let conv = agent.snapshot().await;
        assert!(conv.unanswered_tool_calls().is_empty());
        let results: Vec<&ToolResult> = conv
            .messages()
            .iter()
            .filter_map(|m| m.as_tool_result())
            .collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok() && results[1].is_ok());
        assert_eq!(results[2].error_kind, Some(ToolErrorKind::ExecutionFailed));
        assert_eq!(results[2].output, "tool-call depth limit reached");

        // The loop accepts the next turn.
        assert!(agent.step("stop").is_ok());
    }

    #[tokio::test]
    async fn test_second_step_while_running_is_refused() {
        let client = ScriptedClient::new(vec![ScriptedTurn::chunks(&["a", "b", "c"])])
            .with_delta_delay(Duration::from_millis(50));
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;

        let turn = agent.step("first").unwrap();
        assert!(agent.is_busy());
        let err = agent.step("second").err().unwrap();
        assert!(matches!(err, TermpalError::User(ref m) if m == "turn in progress"));
        turn.finish().await.unwrap();
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_text_as_incomplete() {
        let client = ScriptedClient::new(vec![ScriptedTurn::chunks(&["one ", "two ", "three"])])
            .with_delta_delay(Duration::from_millis(50));
        let (_dir, store, agent) = agent_with(client, AgentSettings::default()).await;

        let mut turn = agent.step("count").unwrap();
        match turn.next().await {
            Some(TurnEvent::Delta(text)) => assert_eq!(text, "one "),
            other => panic!("unexpected event: {:?}", other),
        }
        turn.cancel();
        assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Cancelled);

        let conv = store.load(agent.conversation_id()).await.unwrap();
        let last = conv.last().unwrap();
        assert_eq!(last.status(), MessageStatus::Incomplete);
        assert_eq!(last.text(), "one ");
        assert_eq!(agent.state(), LoopState::AwaitingUserInput);
    }

    #[tokio::test]
    async fn test_cancel_records_only_received_text() {
        // No delay: the backend has produced everything before the caller
        // gets the first delta.
        let client = ScriptedClient::new(vec![ScriptedTurn::chunks(&[
            "one ", "two ", "three ", "four ", "five",
        ])]);
        let (_dir, store, agent) = agent_with(client, AgentSettings::default()).await;

        let mut turn = agent.step("count").unwrap();
        let mut received = String::new();
        for _ in 0..2 {
            match turn.next().await {
                Some(TurnEvent::Delta(text)) => received.push_str(&text),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        turn.cancel();
        assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Cancelled);

        let conv = store.load(agent.conversation_id()).await.unwrap();
        let last = conv.last().unwrap();
        assert_eq!(received, "one two ");
        assert_eq!(last.status(), MessageStatus::Incomplete);
        assert_eq!(last.text(), received);
    }

    #[tokio::test]
    async fn test_finish_without_reading_keeps_full_answer() {
        let client = ScriptedClient::new(vec![ScriptedTurn::chunks(&["a", "b", "c"])]);
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;

        let turn = agent.step("go").unwrap();
        assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Completed);
        let conv = agent.snapshot().await;
        assert_eq!(conv.last().unwrap().text(), "abc");
        assert!(!conv.last().unwrap().is_incomplete());
    }

    #[tokio::test]
    async fn test_mid_stream_error_is_reported() {
        let client = ScriptedClient::new(vec![ScriptedTurn::deltas(vec![
            Delta::Text("partial".into()),
            Delta::Error(BackendError::BackendUnavailable("connection reset".into())),
        ])]);
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;

        let err = agent.step("go").unwrap().finish().await.unwrap_err();
        assert!(matches!(
            err,
            TermpalError::Backend(BackendError::BackendUnavailable(_))
        ));
        let conv = agent.snapshot().await;
        assert!(conv.last().unwrap().is_incomplete());
        assert_eq!(agent.state(), LoopState::AwaitingUserInput);
    }

    #[tokio::test]
    async fn test_codeblock_fallback() {
        let client = ScriptedClient::new(vec![
            ScriptedTurn::text("Sure.\n```sh\necho hi\n```\n"),
            ScriptedTurn::text("done"),
        ]);
        let settings = AgentSettings {
            codeblock_tools: true,
            ..AgentSettings::default()
        };
        let (_dir, store) = store();
        let registry = ToolRegistryBuilder::new()
            .register(crate::tools::shell::ShellTool::new())
            .unwrap()
            .build();
        let agent = AgentLoop::builder(Arc::new(client), ToolExecutor::new(registry), store)
            .settings(settings)
            .confirmation(ConfirmationPolicy::DenyAll)
            .create()
            .await
            .unwrap();

        agent.step("say hi").unwrap().finish().await.unwrap();
        let conv = agent.snapshot().await;
        let call = &conv.messages()[2].tool_calls()[0];
        assert_eq!(call.tool_name, "shell");
        assert_eq!(call.arguments["command"], "echo hi");
        let result = conv.messages()[3].as_tool_result().unwrap();
        assert_eq!(result.error_kind, Some(ToolErrorKind::Denied));
    }

    #[tokio::test]
    async fn test_duplicate_call_ids_are_replaced() {
        let client = ScriptedClient::new(vec![
            ScriptedTurn::tool_call_with_id("same", "echo", json!({"message": "1"})),
            ScriptedTurn::tool_call_with_id("same", "echo", json!({"message": "2"})),
            ScriptedTurn::text("ok"),
        ]);
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;

        agent.step("twice").unwrap().finish().await.unwrap();
        let conv = agent.snapshot().await;
        let ids: Vec<&str> = conv
            .messages()
            .iter()
            .flat_map(|m| m.tool_calls())
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "same");
        assert_ne!(ids[1], "same");
        assert!(conv.unanswered_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn test_resume_answers_interrupted_calls() {
        let (_dir, store) = store();
        let mut conv = Conversation::with_id("resumed", "scripted:scripted-model");
        conv.push(Message::system("sys")).unwrap();
        conv.push(Message::user("run it")).unwrap();
        conv.push(Message::assistant_with_tool_calls(
            "",
            vec![("c9".into(), "echo".into(), json!({"message": "x"}))],
        ))
        .unwrap();
        store.create(&conv).await.unwrap();

        let client = ScriptedClient::new(vec![ScriptedTurn::text("back")]);
        let agent = AgentLoop::builder(Arc::new(client), echo_executor(), Arc::clone(&store))
            .resume("resumed")
            .await
            .unwrap();

        let conv = agent.snapshot().await;
        assert!(conv.unanswered_tool_calls().is_empty());
        let result = conv.last().unwrap().as_tool_result().unwrap();
        assert_eq!(result.error_kind, Some(ToolErrorKind::Cancelled));
        assert!(agent.resume_pending().await.unwrap().is_none());

        let reloaded = store.load("resumed").await.unwrap();
        assert_eq!(reloaded.len(), 4);
    }

    #[tokio::test]
    async fn test_resume_pending_answers_trailing_user_message() {
        let (_dir, store) = store();
        let mut conv = Conversation::with_id("pending", "scripted:scripted-model");
        conv.push(Message::system("sys")).unwrap();
        conv.push(Message::user("are you there?")).unwrap();
        store.create(&conv).await.unwrap();

        let client = ScriptedClient::new(vec![ScriptedTurn::text("yes")]);
        let agent = AgentLoop::builder(Arc::new(client), echo_executor(), store)
            .resume("pending")
            .await
            .unwrap();
        let turn = agent.resume_pending().await.unwrap().unwrap();
        assert_eq!(turn.finish().await.unwrap(), TurnOutcome::Completed);
        assert_eq!(agent.snapshot().await.last().unwrap().text(), "yes");
    }

    #[tokio::test]
    async fn test_closed_and_blank_input_refused() {
        let client = ScriptedClient::new(vec![]);
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;

        assert!(matches!(agent.step("   "), Err(TermpalError::User(_))));
        agent.close();
        assert_eq!(agent.state(), LoopState::Completed);
        assert!(matches!(agent.step("hello"), Err(TermpalError::User(_))));
    }

    #[tokio::test]
    async fn test_create_with_existing_id_refused() {
        let (_dir, store) = store();
        let client: Arc<dyn ModelClient> =
            Arc::new(ScriptedClient::new(vec![ScriptedTurn::text("hi")]));
        let first = AgentLoop::builder(Arc::clone(&client), echo_executor(), Arc::clone(&store))
            .create_with_id("fixed")
            .await
            .unwrap();
        first.step("hello").unwrap().finish().await.unwrap();
        let err = AgentLoop::builder(client, echo_executor(), store)
            .create_with_id("fixed")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TermpalError::User(_)));
    }

    #[tokio::test]
    async fn test_log_written_on_first_input() {
        let client = ScriptedClient::new(vec![ScriptedTurn::text("hi")]);
        let (_dir, store, agent) = agent_with(client, AgentSettings::default()).await;

        assert!(!store.exists(agent.conversation_id()).await);
        assert!(store.list().await.unwrap().is_empty());
        agent.close();
        assert!(!store.exists(agent.conversation_id()).await);

        let client = ScriptedClient::new(vec![ScriptedTurn::text("hi")]);
        let (_dir, store, agent) = agent_with(client, AgentSettings::default()).await;
        agent.step("hello").unwrap().finish().await.unwrap();
        let loaded = store.load(agent.conversation_id()).await.unwrap();
        let roles: Vec<Role> = loaded.messages().iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_add_user_message_is_context_for_next_turn() {
        let client = ScriptedClient::new(vec![ScriptedTurn::text("seen it")]);
        let requests = client.requests();
        let (_dir, store, agent) = agent_with(client, AgentSettings::default()).await;

        agent
            .add_user_message("# filename: notes.txt\n\nbuy milk")
            .await
            .unwrap();
        assert!(store.exists(agent.conversation_id()).await);
        assert!(matches!(
            agent.add_user_message("  ").await,
            Err(TermpalError::User(_))
        ));

        agent.step("what did I load?").unwrap().finish().await.unwrap();
        let requests = requests.lock().unwrap();
        assert!(requests[0]
            .messages
            .iter()
            .any(|m| m.role() == Role::User && m.text().contains("buy milk")));
        drop(requests);

        let loaded = store.load(agent.conversation_id()).await.unwrap();
        assert_eq!(loaded.len(), 4);
    }

    #[tokio::test]
    async fn test_system_prompt_lists_tools() {
        let client = ScriptedClient::new(vec![]);
        let (_dir, _store, agent) = agent_with(client, AgentSettings::default()).await;
        let conv = agent.snapshot().await;
        let system = conv.system_message().unwrap();
        assert!(matches!(system.content(), Content::Text { .. }));
        assert!(system.text().contains("- echo:"));
    }

    #[test]
    fn test_settings_from_config() {
        let config = AgentConfig {
            model: "m".into(),
            max_tool_depth: 3,
            tool_timeout_secs: 5,
            ..AgentConfig::default()
        };
        let settings = AgentSettings::from_config(&config);
        assert_eq!(settings.max_tool_depth, 3);
        assert_eq!(settings.tool_timeout, Duration::from_secs(5));
        assert_eq!(settings.options.model.as_deref(), Some("m"));
    }
}
