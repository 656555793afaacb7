use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use recruit_chat::stream::StreamEntry;
use recruit_chat::{AppConfig, ChatResult, ChatSession, ConversationView};

#[derive(Parser)]
#[command(name = "recruit-chat", version, about = "Recruiter/candidate messaging")]
struct Cli {
    /// Config file to use instead of the platform default
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List conversations, most recent first
    List,
    /// Print the conversation id for a candidate, creating it if needed
    Resolve { candidate: String },
    /// Show a conversation's messages
    Open {
        conversation: String,
        #[arg(long)]
        send: Option<String>,
        /// Keep printing new messages until interrupted
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ChatResult<()> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => AppConfig::load()?,
    };
    let session = ChatSession::init(&config)?;
    let conversations = session.start().await?;

    let result = match cli.command {
        Command::List => {
            for c in &conversations {
                let unread = if c.unread_count > 0 {
                    format!(" ({})", c.unread_count)
                } else {
                    String::new()
                };
                println!(
                    "{}\t{}{}\t{}",
                    c.id,
                    c.display_name(),
                    unread,
                    c.last_message.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::Resolve { candidate } => session.resolve(&candidate).await.map(|id| println!("{id}")),
        Command::Open {
            conversation,
            send,
            follow,
        } => open(&session, &conversation, send, follow).await,
    };
    session.dispose();
    result
}

async fn open(
    session: &ChatSession,
    conversation_id: &str,
    send: Option<String>,
    follow: bool,
) -> ChatResult<()> {
    let view = session.open(conversation_id).await?;
    let mut changes = view.changes();
    // First history page.
    if let Err(e) = changes.changed().await {
        log::debug!("View closed before history arrived: {e}");
    }
    if let Some(err) = view.error() {
        log::warn!("History unavailable: {err}");
    }

    let mut printed = HashSet::new();
    print_new(&view, &mut printed);
    if let Some(text) = send {
        view.set_draft(text);
        view.send().await?;
    }

    if follow {
        log::info!("Following {conversation_id}, press Ctrl-C to stop");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    print_new(&view, &mut printed);
                }
            }
        }
    } else if view.is_empty() {
        println!("No messages yet.");
    }
    view.teardown().await;
    Ok(())
}

/// Print confirmed messages not printed before.
fn print_new(view: &ConversationView, printed: &mut HashSet<String>) {
    for entry in view.messages() {
        if let StreamEntry::Message(m) = entry {
            if printed.insert(m.id.clone()) {
                let body = if m.is_deleted { "[deleted]" } else { m.body.as_str() };
                println!("[{}] {:?}: {}", m.created_at.format("%Y-%m-%d %H:%M"), m.sender_type, body);
            }
        }
    }
}
