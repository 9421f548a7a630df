//! Integration tests for termpal
//!
//! These tests drive the public API of the store, the context window manager
//! and the tool executor together, without a model backend.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use termpal::agent::{ContextWindowManager, ExtractiveSummarizer};
use termpal::config::{ConfirmationPolicy, RetrievalPrecedence};
use termpal::conversation::{Content, Conversation, ConversationStore, Message, ToolStatus};
use termpal::error::{Result, ToolErrorKind};
use termpal::retrieval::{Bm25Index, RetrievalAugmenter, SearchIndex};
use termpal::tools::filesystem::WriteFileTool;
use termpal::tools::{
    EchoTool, ExecutionPolicy, Tool, ToolCategory, ToolContext, ToolExecutor, ToolOutput,
    ToolRegistryBuilder,
};

// ============================================================================
// Conversation store
// ============================================================================

fn sample_conversation(id: &str) -> Conversation {
    let mut conv = Conversation::with_id(id, "scripted:scripted-model");
    conv.push(Message::system("You are a helper")).unwrap();
    conv
}

#[tokio::test]
async fn test_store_roundtrip_preserves_order_and_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();
    let mut conv = sample_conversation("roundtrip");
    store.create(&conv).await.unwrap();

    let call_msg = Message::assistant_with_tool_calls(
        "let me check",
        vec![("c1".into(), "echo".into(), json!({"message": "hi"}))],
    );
    let call = call_msg.tool_calls()[0].clone();
    let messages = vec![
        Message::user("say hi through the tool"),
        call_msg,
        Message::tool_result(termpal::conversation::ToolResult::ok(&call, "hi")),
        Message::assistant("The tool said hi."),
    ];
    for msg in messages {
        store.append(conv.id(), &msg).await.unwrap();
        conv.push(msg).unwrap();
    }

    let loaded = store.load("roundtrip").await.unwrap();
    assert_eq!(loaded.messages(), conv.messages());
    assert_eq!(loaded.meta().backend_used, "scripted:scripted-model");
}

#[tokio::test]
async fn test_store_skips_torn_tail_and_keeps_appending() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();
    let conv = sample_conversation("torn");
    store.create(&conv).await.unwrap();
    store.append("torn", &Message::user("first")).await.unwrap();

    // Simulate a crash in the middle of writing a line.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(store.log_path("torn"))
        .unwrap();
    file.write_all(b"{\"type\":\"message\",\"id\":\"half").unwrap();
    drop(file);

    let reopened = ConversationStore::new(dir.path()).unwrap();
    let loaded = reopened.load("torn").await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.last().unwrap().text(), "first");

    reopened
        .append("torn", &Message::assistant("second"))
        .await
        .unwrap();
    let loaded = reopened.load("torn").await.unwrap();
    let texts: Vec<&str> = loaded.messages().iter().map(|m| m.text()).collect();
    assert_eq!(texts, vec!["You are a helper", "first", "second"]);
}

#[tokio::test]
async fn test_store_list_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();
    store.create(&sample_conversation("one")).await.unwrap();
    store.create(&sample_conversation("two")).await.unwrap();

    let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|i| i.id).collect();
    assert!(ids.contains(&"one".to_string()) && ids.contains(&"two".to_string()));

    assert!(store.delete("one").await.unwrap());
    assert!(!store.delete("one").await.unwrap());
    assert!(!store.exists("one").await);
    assert!(store.load("one").await.is_err());
}

// ============================================================================
// Context window
// ============================================================================

fn long_conversation(turns: usize) -> Conversation {
    let mut conv = sample_conversation("long");
    for i in 0..turns {
        conv.push(Message::user(&format!("question {} {}", i, "detail ".repeat(20))))
            .unwrap();
        conv.push(Message::assistant(&format!("answer {} {}", i, "words ".repeat(30))))
            .unwrap();
    }
    conv.push(Message::user("the latest question")).unwrap();
    conv
}

#[test]
fn test_context_window_respects_budget_at_every_size() {
    let conv = long_conversation(20);
    let manager = ContextWindowManager::new(0)
        .with_summarizer(Arc::new(ExtractiveSummarizer::default()));
    for budget in [20, 60, 150, 400, 1_000, 10_000] {
        let window = manager.build_with_budget(&conv, budget, &[]);
        let total: usize = window.messages.iter().map(|m| m.token_count()).sum();
        assert!(total <= budget, "budget {} exceeded: {}", budget, total);
        assert_eq!(window.total_tokens, total);
    }
}

#[test]
fn test_context_window_keeps_newest_and_summarizes_oldest() {
    let conv = long_conversation(20);
    let manager = ContextWindowManager::new(400)
        .with_summarizer(Arc::new(ExtractiveSummarizer::default()));
    let window = manager.build(&conv, &[]);

    assert_eq!(window.messages[0].text(), "You are a helper");
    assert_eq!(window.messages.last().unwrap().text(), "the latest question");
    let (first, last) = window.dropped.unwrap();
    assert_eq!(first, 1);
    assert!(last >= first);
    if window.has_summary() {
        match window.messages[1].content() {
            Content::Summary {
                first_index,
                last_index,
                ..
            } => assert_eq!((*first_index, *last_index), (first, last)),
            other => panic!("expected summary, got {:?}", other),
        }
    }
}

#[test]
fn test_context_window_is_deterministic() {
    let conv = long_conversation(10);
    let manager = ContextWindowManager::new(300)
        .with_summarizer(Arc::new(ExtractiveSummarizer::default()));
    let a = manager.build(&conv, &[]);
    let b = manager.build(&conv, &[]);
    assert_eq!(a.messages, b.messages);
    assert_eq!(a.dropped, b.dropped);
}

#[tokio::test]
async fn test_retrieval_snippets_enter_window_by_precedence() {
    let mut index = Bm25Index::new();
    index.add_document("setup.md#1", "Install the toolchain with rustup before building.");
    index.add_document("faq.md#1", "The office is closed on public holidays.");
    let index: Arc<dyn SearchIndex> = Arc::new(index);
    let augmenter = RetrievalAugmenter::new(index, 2, 0.0);

    let mut conv = sample_conversation("rag");
    conv.push(Message::user("how do I install the toolchain")).unwrap();
    let candidates = augmenter.candidates(conv.last().unwrap()).await;
    assert!(!candidates.is_empty());
    assert!(matches!(
        candidates[0].content(),
        Content::Snippet { source, .. } if source == "setup.md#1"
    ));

    for precedence in [RetrievalPrecedence::HistoryFirst, RetrievalPrecedence::RetrievalFirst] {
        let window = ContextWindowManager::new(10_000)
            .with_precedence(precedence)
            .build(&conv, &candidates);
        assert!(window
            .messages
            .iter()
            .any(|m| matches!(m.content(), Content::Snippet { .. })));
        assert_eq!(window.messages.last().unwrap().text(), "how do I install the toolchain");
    }
}

// ============================================================================
// Tool executor
// ============================================================================

/// Writes partial output, then sleeps far longer than any test timeout.
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Never finishes in time"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        ctx.output.push_str("step 1 done\n");
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ToolOutput::ok("finished"))
    }
}

fn call_for(name: &str, args: Value) -> termpal::conversation::ToolCall {
    let msg = Message::assistant_with_tool_calls("", vec![("c1".into(), name.into(), args)]);
    msg.tool_calls()[0].clone()
}

fn executor() -> ToolExecutor {
    let registry = ToolRegistryBuilder::new()
        .register(EchoTool)
        .unwrap()
        .register(SlowTool)
        .unwrap()
        .register(WriteFileTool)
        .unwrap()
        .build();
    ToolExecutor::new(registry)
}

#[tokio::test]
async fn test_unknown_tool_never_runs() {
    let result = executor()
        .execute(
            &call_for("does_not_exist", json!({})),
            &ExecutionPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(result.status, ToolStatus::Error);
    assert_eq!(result.error_kind, Some(ToolErrorKind::UnknownTool));
}

#[tokio::test]
async fn test_invalid_arguments_rejected() {
    let result = executor()
        .execute(
            &call_for("echo", json!({"message": 42})),
            &ExecutionPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(result.error_kind, Some(ToolErrorKind::ArgumentValidation));
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() {
    let policy = ExecutionPolicy {
        confirmation: ConfirmationPolicy::AutoApprove,
        timeout: Duration::from_millis(100),
    };
    let result = executor()
        .execute(&call_for("slow", json!({})), &policy, &CancellationToken::new())
        .await;
    assert_eq!(result.status, ToolStatus::Timeout);
    assert!(result.output.contains("step 1 done"));
}

#[tokio::test]
async fn test_deny_all_blocks_destructive_tools() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor().with_workspace(dir.path());
    let policy = ExecutionPolicy {
        confirmation: ConfirmationPolicy::DenyAll,
        ..ExecutionPolicy::default()
    };
    let result = executor
        .execute(
            &call_for("write_file", json!({"path": "x.txt", "content": "data"})),
            &policy,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(result.error_kind, Some(ToolErrorKind::Denied));
    assert!(!dir.path().join("x.txt").exists());

    // Read-only tools are not gated.
    let result = executor
        .execute(
            &call_for("echo", json!({"message": "still fine"})),
            &policy,
            &CancellationToken::new(),
        )
        .await;
    assert!(result.is_ok());
}
