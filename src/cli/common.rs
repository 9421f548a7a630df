//! Shared CLI helpers used across multiple command handlers.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use termpal::agent::{AgentLoop, AgentLoopBuilder};
use termpal::config::Config;
use termpal::conversation::{ConversationStore, ToolCall};
use termpal::providers::build_client;
use termpal::retrieval::{Bm25Index, RetrievalAugmenter, SearchIndex};
use termpal::tools::{builtin_registry, Confirmer, Tool, ToolExecutor};
use termpal::utils::string::preview;

use super::ChatArgs;

/// Load configuration from `path`, or from the default location.
pub(crate) fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    config.with_context(|| "Failed to load configuration")
}

/// Open the conversation store named by the configuration.
pub(crate) fn open_store(config: &Config) -> Result<Arc<ConversationStore>> {
    let store = ConversationStore::new(config.storage_path())
        .with_context(|| "Failed to open conversation store")?;
    Ok(Arc::new(store))
}

/// Lines typed on stdin, read by one background thread.
///
/// The REPL prompt and the confirmation gate both read from here, so a
/// prompt abandoned by Ctrl-C never swallows the next line.
#[derive(Clone)]
pub(crate) struct InputLines {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl InputLines {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(16);
        std::thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next line, or `None` at end of input.
    pub(crate) async fn next(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

/// Print `text` without a newline and flush stdout.
pub(crate) fn prompt(text: &str) {
    print!("{}", text);
    let _ = io::stdout().flush();
}

/// Asks on the terminal before a destructive tool runs.
pub(crate) struct StdinConfirmer {
    input: InputLines,
}

impl StdinConfirmer {
    pub(crate) fn new(input: InputLines) -> Self {
        Self { input }
    }
}

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, call: &ToolCall, _tool: &dyn Tool) -> bool {
        println!();
        println!("The assistant wants to run '{}':", call.tool_name);
        for (key, value) in call.arguments.as_object().into_iter().flatten() {
            let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            println!("  {}: {}", key, preview(&shown, 400));
        }
        prompt("Allow? [y/N] ");
        match self.input.next().await {
            Some(answer) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            None => false,
        }
    }
}

/// Apply chat flags on top of the loaded configuration.
pub(crate) fn apply_chat_args(config: &mut Config, args: &ChatArgs) {
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }
    if let Some(model) = &args.model {
        config.agent.model = model.clone();
    }
    if let Some(policy) = args.confirm {
        config.tools.confirmation = policy;
    }
}

/// Build the agent loop for a chat session: backend, tools, retrieval and
/// the conversation to continue or create.
pub(crate) async fn create_agent(
    config: &Config,
    args: &ChatArgs,
    input: InputLines,
) -> Result<AgentLoop> {
    config.validate()?;

    let store = open_store(config)?;
    let index: Option<Arc<dyn SearchIndex>> = if config.retrieval.enabled {
        let docs = config.docs_path();
        let index = Bm25Index::from_dir(&docs)
            .with_context(|| format!("Failed to index documents in {}", docs.display()))?;
        info!(documents = index.len(), dir = %docs.display(), "Retrieval index ready");
        Some(Arc::new(index))
    } else {
        None
    };

    let registry = builtin_registry(config, index.clone())?;
    let executor = ToolExecutor::new(registry)
        .with_confirmer(Arc::new(StdinConfirmer::new(input)))
        .with_workspace(config.workspace_path())
        .with_env_allowlist(config.tools.env_allowlist.clone())
        .with_max_output_chars(config.tools.max_output_chars);
    let client = build_client(config)?;

    let mut builder = AgentLoop::builder(client, executor, Arc::clone(&store)).configure(config);
    if let Some(index) = index {
        builder = builder.augmenter(RetrievalAugmenter::new(
            index,
            config.retrieval.top_k,
            config.retrieval.min_score,
        ));
    }

    open_conversation(builder, &store, args).await
}

async fn open_conversation(
    builder: AgentLoopBuilder,
    store: &ConversationStore,
    args: &ChatArgs,
) -> Result<AgentLoop> {
    let agent = match (&args.conversation, args.resume) {
        (Some(id), true) => builder.resume(id).await?,
        (Some(id), false) => builder.create_with_id(id).await?,
        (None, true) => match store.list().await?.last() {
            Some(latest) => builder.resume(&latest.id).await?,
            None => {
                warn!("No stored conversation to resume; starting a new one");
                builder.create().await?
            }
        },
        (None, false) => builder.create().await?,
    };
    Ok(agent)
}
