//! Chat command: one-shot prompt or interactive REPL.

use std::io::{self, Write};

use anyhow::Result;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use termpal::agent::{AgentLoop, TurnEvent, TurnHandle, TurnOutcome};
use termpal::config::{Config, ConfirmationPolicy};
use termpal::conversation::{ToolCall, ToolResult};
use termpal::tools::ExecutionPolicy;
use termpal::utils::string::preview;

use super::common::{apply_chat_args, create_agent, prompt, InputLines};
use super::history::print_transcript;
use super::ChatArgs;

const HELP: &str = "\
Commands:
  .help            Show this help
  .exit            Leave the session
  .history         Show the conversation so far
  .tools           List the tools the assistant can use
  .shell <cmd>     Run a shell command yourself
  .python <code>   Run Python code yourself
  .load <file>     Add a file's contents to the conversation

Ctrl-C cancels a running reply; Ctrl-C at the prompt exits.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum DotCommand {
    Help,
    Exit,
    History,
    Tools,
    Shell(String),
    Python(String),
    Load(String),
    Unknown(String),
}

impl DotCommand {
    /// Parse a REPL line starting with `.`; other lines are messages.
    fn parse(line: &str) -> Option<Self> {
        let command = line.strip_prefix('.')?;
        let (name, rest) = command
            .split_once(char::is_whitespace)
            .unwrap_or((command, ""));
        let rest = rest.trim().to_string();
        Some(match name {
            "help" | "h" => DotCommand::Help,
            "exit" | "quit" | "q" => DotCommand::Exit,
            "history" => DotCommand::History,
            "tools" => DotCommand::Tools,
            "shell" | "sh" => DotCommand::Shell(rest),
            "python" | "py" => DotCommand::Python(rest),
            "load" => DotCommand::Load(rest),
            other => DotCommand::Unknown(other.to_string()),
        })
    }
}

pub(crate) async fn cmd_chat(mut config: Config, args: ChatArgs) -> Result<()> {
    apply_chat_args(&mut config, &args);
    let input = InputLines::spawn();
    let agent = create_agent(&config, &args, input.clone()).await?;

    if let Some(turn) = agent.resume_pending().await? {
        println!("Answering the last message of the resumed conversation...");
        report(run_turn(turn).await)?;
    }

    match args.prompt.as_deref() {
        Some(message) => {
            let outcome = run_turn(agent.step(message)?).await;
            agent.close();
            match outcome? {
                TurnOutcome::Completed => Ok(()),
                TurnOutcome::Cancelled => anyhow::bail!("cancelled"),
            }
        }
        None => repl(&agent, &input).await,
    }
}

async fn repl(agent: &AgentLoop, input: &InputLines) -> Result<()> {
    println!(
        "termpal {} (conversation {}, backend {})",
        env!("CARGO_PKG_VERSION"),
        agent.conversation_id(),
        agent.backend_label()
    );
    println!("Type a message and press Enter, or .help for commands.");
    println!();

    loop {
        prompt("> ");
        let line = tokio::select! {
            line = input.next() => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = DotCommand::parse(line) {
            match command {
                DotCommand::Exit => break,
                DotCommand::Help => println!("{}", HELP),
                DotCommand::History => print_transcript(&agent.snapshot().await, Some(300)),
                DotCommand::Tools => {
                    for def in agent.registry().definitions() {
                        println!("  {:<12} {}", def.name, def.description);
                    }
                }
                DotCommand::Shell(cmd) if !cmd.is_empty() => {
                    run_manual(agent, "shell", json!({ "command": cmd })).await
                }
                DotCommand::Python(code) if !code.is_empty() => {
                    run_manual(agent, "python", json!({ "code": code })).await
                }
                DotCommand::Shell(_) | DotCommand::Python(_) => {
                    eprintln!("Nothing to run. Usage: .shell <cmd> or .python <code>")
                }
                DotCommand::Load(path) if !path.is_empty() => match load_file(agent, &path).await {
                    Ok(bytes) => println!("Loaded {} ({} bytes)", path, bytes),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => eprintln!("Error: {}", e),
                },
                DotCommand::Load(_) => eprintln!("Nothing to load. Usage: .load <file>"),
                DotCommand::Unknown(name) => {
                    eprintln!("Unknown command '.{}'. Type .help for commands.", name)
                }
            }
            continue;
        }

        match agent.step(line) {
            Ok(turn) => report(run_turn(turn).await)?,
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    agent.close();
    println!("Goodbye!");
    Ok(())
}

/// Print a turn's events as they arrive. Ctrl-C cancels the turn.
async fn run_turn(mut turn: TurnHandle) -> termpal::error::Result<TurnOutcome> {
    let cancel = turn.cancellation_token();
    let mut at_line_start = true;
    loop {
        tokio::select! {
            event = turn.next() => match event {
                Some(TurnEvent::Delta(text)) => {
                    print!("{}", text);
                    let _ = io::stdout().flush();
                    at_line_start = text.ends_with('\n');
                }
                Some(TurnEvent::ToolCall(call)) => {
                    if !at_line_start {
                        println!();
                    }
                    print_call(&call);
                    at_line_start = true;
                }
                Some(TurnEvent::ToolResult(result)) => print_result(&result),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("Cancelling...");
                cancel.cancel();
            }
        }
    }
    if !at_line_start {
        println!();
    }
    turn.finish().await
}

/// Show how a turn ended. Only fatal errors stop the session.
fn report(outcome: termpal::error::Result<TurnOutcome>) -> Result<()> {
    match outcome {
        Ok(TurnOutcome::Completed) => {}
        Ok(TurnOutcome::Cancelled) => eprintln!("(cancelled)"),
        Err(e) if e.is_fatal() => return Err(e.into()),
        Err(e) => eprintln!("Error: {}", e),
    }
    println!();
    Ok(())
}

fn print_call(call: &ToolCall) {
    println!("-> {} {}", call.tool_name, preview(&call.arguments.to_string(), 200));
}

fn print_result(result: &ToolResult) {
    println!("<- {} ({})", result.tool_name, result.status);
    for line in result.output.lines().take(20) {
        println!("   {}", preview(line, 200));
    }
    let extra = result.output.lines().count().saturating_sub(20);
    if extra > 0 {
        println!("   ... {} more line(s)", extra);
    }
}

/// Run a tool the user asked for directly. The user typed it, so the
/// confirmation gate is skipped and nothing is added to the conversation.
async fn run_manual(agent: &AgentLoop, tool: &str, arguments: serde_json::Value) {
    let call = ToolCall {
        id: "manual".to_string(),
        tool_name: tool.to_string(),
        arguments,
        originating_message_id: String::new(),
    };
    let policy = ExecutionPolicy {
        confirmation: ConfirmationPolicy::AutoApprove,
        ..ExecutionPolicy::default()
    };
    let cancel = CancellationToken::new();
    let run = agent.executor().execute(&call, &policy, &cancel);
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = tokio::signal::ctrl_c() => cancel.cancel(),
        }
    };
    print_result(&result);
}

/// Add a file to the conversation as a user message. The next turn sees it.
async fn load_file(agent: &AgentLoop, path: &str) -> termpal::error::Result<usize> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        termpal::error::TermpalError::User(format!("cannot read {}: {}", path, e))
    })?;
    agent.add_user_message(&file_message(path, &contents)).await?;
    Ok(contents.len())
}

fn file_message(path: &str, contents: &str) -> String {
    format!("# filename: {}\n\n{}", path, contents)
}
