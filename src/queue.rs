use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::types::{OutboxRecord, Prompt};

/// Append-only inbox/outbox pair. One JSON record per line; the store
/// never rewrites or deletes prior lines.
pub(crate) struct QueueStore {
    inbox: PathBuf,
    outbox: PathBuf,
}

impl QueueStore {
    pub(crate) fn new(inbox: PathBuf, outbox: PathBuf) -> Self {
        QueueStore { inbox, outbox }
    }

    /// Producer-side append. External writers use the same format, so the
    /// record must stay a single line.
    pub(crate) fn append_prompt(&self, prompt: &Prompt) -> Result<(), Box<dyn std::error::Error>> {
        append_jsonl(&self.inbox, &serde_json::to_string(prompt)?)
    }

    pub(crate) fn append_result(
        &self,
        record: &OutboxRecord,
    ) -> Result<(), Box<dyn std::error::Error>> {
        append_jsonl(&self.outbox, &serde_json::to_string(record)?)
    }

    /// Read the full inbox in file order, skipping ids already seen. A
    /// missing file is an empty queue. A malformed interior line is logged
    /// and skipped; a malformed *final* line is treated as a concurrent
    /// half-written append and skipped silently; it will parse on the
    /// next poll.
    pub(crate) fn read_unprocessed(&self, seen: &SeenIds) -> Vec<Prompt> {
        let raw = match fs::read_to_string(&self.inbox) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                eprintln!("[queue] inbox read error: {err}");
                return Vec::new();
            }
        };
        let lines: Vec<&str> = raw.lines().collect();
        let last_idx = lines.len().saturating_sub(1);
        let mut prompts = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let prompt: Prompt = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(err) => {
                    if idx != last_idx {
                        eprintln!("[queue] skipping malformed inbox line {}: {err}", idx + 1);
                    }
                    continue;
                }
            };
            if !seen.contains(&prompt.id) {
                prompts.push(prompt);
            }
        }
        prompts
    }
}

fn append_jsonl(path: &Path, line: &str) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// The durable record of which prompt ids have already been dispatched.
/// Grows monotonically; persisted synchronously on every mark so a restart
/// never reprocesses a prompt that was already handed to the model.
pub(crate) struct SeenIds {
    path: PathBuf,
    ids: HashSet<String>,
}

impl SeenIds {
    pub(crate) fn load(path: PathBuf) -> Self {
        let ids = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(list) => list.into_iter().collect(),
                Err(err) => {
                    eprintln!("[queue] seen-id set corrupt, recovered as empty: {err}");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        };
        SeenIds { path, ids }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Mark an id as dispatched and persist before returning. The write
    /// happens before the prompt's action executes: at-most-once intake is
    /// traded for possible prompt loss on a crash mid-processing.
    pub(crate) fn mark(&mut self, id: &str) -> Result<(), Box<dyn std::error::Error>> {
        if !self.ids.insert(id.to_string()) {
            return Ok(());
        }
        let mut list: Vec<&String> = self.ids.iter().collect();
        list.sort();
        fs::write(&self.path, serde_json::to_vec(&list)?)?;
        Ok(())
    }
}
