use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "promptd")]
#[command(about = "File-queue agent: prompts in, audited actions out", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the polling pipeline against the state directory.
    Run {
        /// State directory holding inbox, outbox, memory and audit files.
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Directory actions are allowed to write into (also the command cwd).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Inbox poll interval in milliseconds.
        #[arg(long, default_value_t = 2000)]
        poll_ms: u64,
        /// Prior exchanges sent to the model as context.
        #[arg(long, default_value_t = 5)]
        context_turns: usize,
        /// Local model name.
        #[arg(long)]
        model: Option<String>,
        /// Local model endpoint base URL.
        #[arg(long)]
        model_url: Option<String>,
        /// Drain the inbox once and exit instead of polling.
        #[arg(long)]
        once: bool,
        /// Never fall back to remote providers.
        #[arg(long)]
        no_remote: bool,
    },

    /// Append a prompt to the inbox.
    Send {
        text: String,
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Conversation to attach the prompt to.
        #[arg(short, long)]
        conversation: Option<String>,
    },

    /// Inspect or reset the prompt/reply history.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },

    /// Print recent audit log entries.
    Audit {
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Number of entries, newest last.
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub(crate) enum MemoryCommand {
    /// Print stored exchanges, oldest first.
    Show {
        #[arg(long)]
        state_dir: Option<PathBuf>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Delete all stored exchanges.
    Clear {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}
