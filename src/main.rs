//! commgate: warm gateway daemon for personal communication data.
//!
//! A thin CLI over a long-lived daemon that keeps message database
//! handles, OAuth tokens, and the contact directory hot.

use anyhow::Result;
use clap::{Parser, Subcommand};
use commgate::config::Config;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

#[derive(Parser)]
#[command(name = "commgate")]
#[command(about = "Warm gateway daemon for messages, contacts, calendar, reminders, and email")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the gateway daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },

    /// Call any service method directly
    Call {
        /// Target service (messages, contacts, calendar, email, reminders, daemon)
        service: String,

        /// Method name
        method: String,

        /// Method params as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Round-trip timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Message shortcuts
    Messages {
        #[command(subcommand)]
        action: MessagesAction,
    },

    /// Contact shortcuts
    Contacts {
        #[command(subcommand)]
        action: ContactsAction,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Start the daemon in the foreground (use a service manager to background it)
    Start,

    /// Stop a running daemon
    Stop,

    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
pub enum MessagesAction {
    /// Unread count only
    UnreadCount,

    /// Unread messages
    Unread {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Most recent messages across chats
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Keyword search over message text
    Search {
        query: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only messages after this instant (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
    },

    /// Messages exchanged with a contact (free-text name accepted)
    With {
        contact: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Send a message (dispatched at most once, never retried)
    Send {
        /// Recipient: contact name, phone number, or email
        to: String,

        /// Message body
        text: String,
    },
}

#[derive(Subcommand)]
pub enum ContactsAction {
    /// Resolve a free-text name to a canonical identifier
    Resolve { query: String },

    /// List the full directory
    List,

    /// Re-read the directory file from disk
    Resync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)?;

    match cli.command {
        Commands::Daemon { action } => commands::daemon::run(config, action, cli.pretty).await,
        Commands::Call {
            service,
            method,
            params,
            timeout_ms,
        } => commands::call::run(config, service, method, params, timeout_ms, cli.pretty).await,
        Commands::Messages { action } => commands::messages::run(config, action, cli.pretty).await,
        Commands::Contacts { action } => commands::contacts::run(config, action, cli.pretty).await,
    }
}
