//! CLI module - command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod chat;
pub mod common;
pub mod history;

use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use termpal::config::{BackendKind, ConfirmationPolicy};

#[derive(Parser)]
#[command(name = "termpal")]
#[command(version)]
#[command(about = "Conversational assistant for your terminal", long_about = None)]
struct Cli {
    /// Config file (default: ~/.termpal/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant (one turn with PROMPT, otherwise interactive)
    Chat(ChatArgs),
    /// List stored conversations
    List,
    /// Print a stored conversation
    Show {
        /// Conversation id
        id: String,
    },
    /// Delete a stored conversation
    Delete {
        /// Conversation id
        id: String,
    },
    /// Show version information
    Version,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct ChatArgs {
    /// Message to send; starts an interactive session when omitted
    pub prompt: Option<String>,
    /// Conversation id to create, or to continue with --resume
    #[arg(long, value_name = "ID")]
    pub conversation: Option<String>,
    /// Continue a stored conversation (the most recent one without --conversation)
    #[arg(long)]
    pub resume: bool,
    /// Confirmation policy for destructive tools
    #[arg(long, value_name = "POLICY")]
    pub confirm: Option<ConfirmationPolicy>,
    /// Model backend
    #[arg(long, value_name = "KIND")]
    pub backend: Option<BackendKind>,
    /// Model identifier
    #[arg(long)]
    pub model: Option<String>,
}

/// Entry point for the CLI - called from main().
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = common::load_config(cli.config.as_deref())?;
    if let Err(e) = termpal::utils::logging::init_logging(&config.logging) {
        eprintln!("Warning: {}", e);
    }

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Version) => {
            cmd_version();
        }
        Some(Commands::Chat(args)) => {
            chat::cmd_chat(config, args).await?;
        }
        Some(Commands::List) => {
            history::cmd_list(&config).await?;
        }
        Some(Commands::Show { id }) => {
            history::cmd_show(&config, &id).await?;
        }
        Some(Commands::Delete { id }) => {
            history::cmd_delete(&config, &id).await?;
        }
    }

    Ok(())
}

/// Display version information
fn cmd_version() {
    println!("termpal {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Conversational assistant for your terminal");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_chat_flags() {
        let cli = Cli::try_parse_from([
            "termpal",
            "chat",
            "hello there",
            "--resume",
            "--conversation",
            "abc",
            "--confirm",
            "deny-all",
            "--backend",
            "local",
            "--model",
            "llama3",
        ])
        .unwrap();
        let Some(Commands::Chat(args)) = cli.command else {
            panic!("expected chat");
        };
        assert_eq!(args.prompt.as_deref(), Some("hello there"));
        assert!(args.resume);
        assert_eq!(args.conversation.as_deref(), Some("abc"));
        assert_eq!(args.confirm, Some(ConfirmationPolicy::DenyAll));
        assert_eq!(args.backend, Some(BackendKind::Local));
        assert_eq!(args.model.as_deref(), Some("llama3"));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["termpal", "list", "--config", "/tmp/c.json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(cli.command, Some(Commands::List)));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        assert!(Cli::try_parse_from(["termpal", "chat", "--confirm", "sometimes"]).is_err());
    }
}
