mod cli;
mod config;
mod exec;
mod extract;
mod memory;
mod model;
mod pipeline;
mod queue;
mod types;
mod util;

use std::path::PathBuf;

use clap::Parser;

use cli::{Cli, Command, MemoryCommand};
use config::PipelineConfig;
use memory::MemoryStore;
use model::ModelClient;
use pipeline::Pipeline;
use queue::QueueStore;
use types::{AuditRecord, Prompt};
use util::{now_ts, now_ts_millis};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            state_dir,
            workspace,
            poll_ms,
            context_turns,
            model,
            model_url,
            once,
            no_remote,
        } => {
            let config = PipelineConfig::resolve(
                state_dir,
                workspace,
                poll_ms,
                context_turns,
                model,
                model_url,
                no_remote,
            )?;
            config.ensure_state_dir()?;
            let client = ModelClient::new(&config);
            let mut pipeline = Pipeline::new(config, client);
            pipeline.run(once);
            Ok(())
        }

        Command::Send {
            text,
            state_dir,
            conversation,
        } => {
            let config = state_config(state_dir)?;
            config.ensure_state_dir()?;
            let queue = QueueStore::new(config.inbox_path(), config.outbox_path());
            let prompt = Prompt {
                id: now_ts_millis().to_string(),
                text,
                timestamp: now_ts(),
                conversation_id: conversation,
            };
            queue.append_prompt(&prompt)?;
            println!("queued prompt {}", prompt.id);
            Ok(())
        }

        Command::Memory { command } => match command {
            MemoryCommand::Show { state_dir, limit } => {
                let config = state_config(state_dir)?;
                let store = MemoryStore::load(config.memory_path());
                for entry in store.recent(limit, None) {
                    println!(
                        "{} [{}]\n  > {}\n  < {}",
                        format_ts(entry.timestamp),
                        entry.conversation_id,
                        entry.prompt,
                        entry.reply
                    );
                }
                Ok(())
            }
            MemoryCommand::Clear { state_dir } => {
                let config = state_config(state_dir)?;
                let mut store = MemoryStore::load(config.memory_path());
                store.clear()?;
                println!("memory cleared");
                Ok(())
            }
        },

        Command::Audit { state_dir, limit } => {
            let config = state_config(state_dir)?;
            let raw = std::fs::read_to_string(config.audit_path()).unwrap_or_default();
            let lines: Vec<&str> = raw.lines().collect();
            let skip = lines.len().saturating_sub(limit);
            for line in &lines[skip..] {
                match serde_json::from_str::<AuditRecord>(line) {
                    Ok(record) => println!(
                        "{} {:<8} {:<16} {} {}",
                        format_ts(record.timestamp),
                        format!("{:?}", record.status).to_lowercase(),
                        record.action_type,
                        record.filepath.as_deref().unwrap_or("-"),
                        record.details.lines().next().unwrap_or("")
                    ),
                    Err(_) => println!("{line}"),
                }
            }
            Ok(())
        }
    }
}

/// Config for the read-side subcommands, where only the state dir matters.
fn state_config(state_dir: Option<PathBuf>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    PipelineConfig::resolve(state_dir, None, 2000, 5, None, None, false)
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
