use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::{env_optional, env_u64};

pub(crate) const DEFAULT_STATE_DIR: &str = "promptd-state";
pub(crate) const DEFAULT_MODEL: &str = "openchat";
pub(crate) const DEFAULT_MODEL_URL: &str = "http://localhost:11434";
pub(crate) const STOP_SENTINEL: &str = "STOP_AGENT";
pub(crate) const RESOURCE_SENTINEL: &str = "RESOURCE_FOCUS";

/// Everything the pipeline needs to run, resolved once at startup from
/// CLI flags with `PROMPTD_*` env fallbacks.
#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    pub(crate) state_dir: PathBuf,
    pub(crate) workspace: PathBuf,
    pub(crate) poll_ms: u64,
    pub(crate) context_turns: usize,
    pub(crate) model: String,
    pub(crate) model_url: String,
    pub(crate) model_timeout_secs: u64,
    pub(crate) command_timeout_secs: u64,
    pub(crate) allow_remote: bool,
}

impl PipelineConfig {
    pub(crate) fn resolve(
        state_dir: Option<PathBuf>,
        workspace: Option<PathBuf>,
        poll_ms: u64,
        context_turns: usize,
        model: Option<String>,
        model_url: Option<String>,
        no_remote: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let state_dir = state_dir
            .or_else(|| env_optional("PROMPTD_STATE_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let workspace =
            match workspace.or_else(|| env_optional("PROMPTD_WORKSPACE").map(PathBuf::from)) {
                Some(ws) => ws,
                None => env::current_dir()?,
            };
        let model = model
            .or_else(|| env_optional("PROMPTD_MODEL"))
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let model_url = model_url
            .or_else(|| env_optional("PROMPTD_MODEL_URL"))
            .unwrap_or_else(|| DEFAULT_MODEL_URL.to_string());

        Ok(PipelineConfig {
            state_dir,
            workspace,
            poll_ms,
            context_turns,
            model,
            model_url,
            model_timeout_secs: env_u64("PROMPTD_MODEL_TIMEOUT_SECS", 15)?,
            command_timeout_secs: env_u64("PROMPTD_COMMAND_TIMEOUT_SECS", 30)?,
            allow_remote: !no_remote,
        })
    }

    /// Creating the state dir is the one startup step allowed to be fatal:
    /// without a writable queue directory nothing downstream can degrade
    /// gracefully.
    pub(crate) fn ensure_state_dir(&self) -> Result<(), Box<dyn std::error::Error>> {
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(&self.workspace)?;
        Ok(())
    }

    pub(crate) fn inbox_path(&self) -> PathBuf {
        self.state_dir.join("inbox.jsonl")
    }

    pub(crate) fn outbox_path(&self) -> PathBuf {
        self.state_dir.join("outbox.jsonl")
    }

    pub(crate) fn seen_ids_path(&self) -> PathBuf {
        self.state_dir.join("seen_ids.json")
    }

    pub(crate) fn memory_path(&self) -> PathBuf {
        self.state_dir.join("agent_memory.json")
    }

    pub(crate) fn audit_path(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }

    pub(crate) fn stop_sentinel(&self) -> PathBuf {
        self.state_dir.join(STOP_SENTINEL)
    }

    pub(crate) fn resource_sentinel(&self) -> PathBuf {
        self.state_dir.join(RESOURCE_SENTINEL)
    }

    /// Roots that write-path actions may touch. `PROMPTD_FS_ROOTS` (colon
    /// separated) overrides; the default is the workspace plus /tmp as a
    /// scratch root.
    pub(crate) fn allowed_write_roots(&self) -> Vec<PathBuf> {
        if let Some(raw) = env_optional("PROMPTD_FS_ROOTS") {
            let roots: Vec<PathBuf> = raw
                .split(':')
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .collect();
            if !roots.is_empty() {
                return roots;
            }
        }
        vec![self.workspace.clone(), PathBuf::from("/tmp")]
    }
}

/// Resolve an action path against the allow-list. Absolute paths must land
/// under one of the roots; relative paths are tried under each root in
/// order. The candidate's parent is canonicalized when the file does not
/// exist yet, so symlinked escapes are caught before any write happens.
pub(crate) fn resolve_write_path(path: &str, roots: &[PathBuf]) -> Result<PathBuf, String> {
    let raw = PathBuf::from(path);
    let candidates: Vec<PathBuf> = if raw.is_absolute() {
        vec![raw.clone()]
    } else {
        roots.iter().map(|r| r.join(&raw)).collect()
    };
    for root in roots {
        let Ok(root_canon) = fs::canonicalize(root) else {
            continue;
        };
        for cand in &candidates {
            let cand_canon = if cand.exists() {
                match fs::canonicalize(cand) {
                    Ok(c) => c,
                    Err(_) => continue,
                }
            } else if let Some(parent) = nearest_existing_parent(cand) {
                let Ok(parent_canon) = fs::canonicalize(&parent) else {
                    continue;
                };
                let Ok(rest) = cand.strip_prefix(&parent) else {
                    continue;
                };
                parent_canon.join(rest)
            } else {
                continue;
            };
            if cand_canon.starts_with(&root_canon) {
                return Ok(cand.clone());
            }
        }
    }
    Err(format!("path outside allowed roots: {path}"))
}

fn nearest_existing_parent(path: &Path) -> Option<PathBuf> {
    let mut current = path.parent()?;
    loop {
        if current.exists() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}
