use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use crate::config::{self, PipelineConfig};
use crate::types::{Action, ActionStatus, AuditRecord};
use crate::util::{build_shell_command, kill_process_tree, now_ts, subprocess_output_text};

/// Carries out extracted actions against the filesystem and shell. Every
/// attempt, whatever its outcome, appends exactly one record to the audit
/// log before this returns.
pub(crate) struct ActionExecutor {
    audit_path: PathBuf,
    workspace: PathBuf,
    write_roots: Vec<PathBuf>,
    command_timeout: Duration,
}

impl ActionExecutor {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        ActionExecutor {
            audit_path: config.audit_path(),
            workspace: config.workspace.clone(),
            write_roots: config.allowed_write_roots(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    /// Dispatch a single action. Returns the audit record that was written;
    /// the only error path is a failure to write the audit log itself.
    pub(crate) fn execute(&self, action: &Action) -> Result<AuditRecord, Box<dyn std::error::Error>> {
        let (status, details) = match action {
            Action::CreateFile { path, content, .. } => self.run_create_file(path, content),
            Action::UpdateFile {
                path,
                content,
                old_content,
                ..
            } => self.run_update_file(path, content, old_content.as_deref()),
            Action::ExecuteCommand { content, .. } => self.run_execute_command(content),
            Action::UpdateDoc { path, content, .. } => {
                self.run_update_doc(path, content, action.reason())
            }
            Action::ReadFile { path, .. } => self.run_read_file(path),
        };
        let record = AuditRecord {
            timestamp: now_ts(),
            action_type: action.kind_name().to_string(),
            filepath: action.path().map(|p| p.to_string()),
            reason: action.reason().to_string(),
            status,
            details,
        };
        self.append_audit(&record)?;
        Ok(record)
    }

    /// Audit trail entry for an object the extractor refused to turn into
    /// an action.
    pub(crate) fn audit_rejection(
        &self,
        kind: &str,
        detail: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.append_audit(&AuditRecord {
            timestamp: now_ts(),
            action_type: kind.to_string(),
            filepath: None,
            reason: String::new(),
            status: ActionStatus::Rejected,
            details: detail.to_string(),
        })
    }

    /// Audit trail entry for a prompt that yielded nothing actionable. The
    /// prompt text goes into details so an operator can find and replay it.
    pub(crate) fn audit_extraction_failure(
        &self,
        prompt_text: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.append_audit(&AuditRecord {
            timestamp: now_ts(),
            action_type: "ExtractionFailed".to_string(),
            filepath: None,
            reason: String::new(),
            status: ActionStatus::Failed,
            details: prompt_text.to_string(),
        })
    }

    fn append_audit(&self, record: &AuditRecord) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = self.audit_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Allow-list check shared by the write-path actions. Rejection here is
    /// a policy outcome, not an error.
    fn resolve_target(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("empty path".to_string());
        }
        config::resolve_write_path(path, &self.write_roots)
    }

    fn run_create_file(&self, path: &str, content: &str) -> (ActionStatus, String) {
        let target = match self.resolve_target(path) {
            Ok(t) => t,
            Err(why) => return (ActionStatus::Rejected, why),
        };
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(err) = fs::create_dir_all(parent) {
                    return (ActionStatus::Failed, format!("mkdir failed: {err}"));
                }
            }
        }
        match fs::write(&target, content) {
            Ok(()) => (
                ActionStatus::Success,
                format!("wrote {} bytes", content.len()),
            ),
            Err(err) => (ActionStatus::Failed, format!("write failed: {err}")),
        }
    }

    fn run_update_file(
        &self,
        path: &str,
        content: &str,
        old_content: Option<&str>,
    ) -> (ActionStatus, String) {
        let target = match self.resolve_target(path) {
            Ok(t) => t,
            Err(why) => return (ActionStatus::Rejected, why),
        };
        // Updating a file that does not exist is a failure, not an implicit
        // create; the model asked to modify something that is not there.
        let existing = match fs::read_to_string(&target) {
            Ok(text) => text,
            Err(err) => return (ActionStatus::Failed, format!("read failed: {err}")),
        };
        let updated = match old_content {
            Some(old) if !old.is_empty() => {
                // Replace-in-place with nothing to replace must not touch
                // the rest of the document.
                if !existing.contains(old) {
                    return (
                        ActionStatus::Failed,
                        "oldContent not found in file".to_string(),
                    );
                }
                existing.replacen(old, content, 1)
            }
            _ => content.to_string(),
        };
        match fs::write(&target, &updated) {
            Ok(()) => (
                ActionStatus::Success,
                format!("updated, now {} bytes", updated.len()),
            ),
            Err(err) => (ActionStatus::Failed, format!("write failed: {err}")),
        }
    }

    fn run_execute_command(&self, command: &str) -> (ActionStatus, String) {
        if command.trim().is_empty() {
            return (ActionStatus::Rejected, "empty command".to_string());
        }
        let mut cmd = build_shell_command(command);
        cmd.current_dir(&self.workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return (ActionStatus::Failed, format!("spawn failed: {err}")),
        };
        let deadline = Instant::now() + self.command_timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        kill_process_tree(&mut child);
                        return (
                            ActionStatus::Failed,
                            format!(
                                "command timed out after {}s",
                                self.command_timeout.as_secs()
                            ),
                        );
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    kill_process_tree(&mut child);
                    return (ActionStatus::Failed, format!("wait failed: {err}"));
                }
            }
        }
        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(err) => return (ActionStatus::Failed, format!("output capture failed: {err}")),
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let failed = !output.status.success();
        let details = subprocess_output_text(stdout.trim(), stderr.trim(), failed);
        if failed {
            (
                ActionStatus::Failed,
                format!("exit {}: {details}", output.status.code().unwrap_or(-1)),
            )
        } else {
            (ActionStatus::Success, details)
        }
    }

    /// Append a dated bullet under the document's `## Changelog` heading,
    /// creating the heading at end of file when absent.
    fn run_update_doc(&self, path: &str, fragment: &str, reason: &str) -> (ActionStatus, String) {
        let target = match self.resolve_target(path) {
            Ok(t) => t,
            Err(why) => return (ActionStatus::Rejected, why),
        };
        let existing = match fs::read_to_string(&target) {
            Ok(text) => text,
            Err(err) => return (ActionStatus::Failed, format!("read failed: {err}")),
        };
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        let bullet = format!("- {stamp} ({reason}): {fragment}");
        let updated = insert_changelog_bullet(&existing, &bullet);
        match fs::write(&target, &updated) {
            Ok(()) => (ActionStatus::Success, "changelog entry appended".to_string()),
            Err(err) => (ActionStatus::Failed, format!("write failed: {err}")),
        }
    }

    fn run_read_file(&self, path: &str) -> (ActionStatus, String) {
        if path.trim().is_empty() {
            return (ActionStatus::Rejected, "empty path".to_string());
        }
        match fs::read_to_string(path) {
            Ok(content) => (ActionStatus::Success, content),
            Err(err) => (ActionStatus::Failed, format!("read failed: {err}")),
        }
    }
}

/// The bullet lands at the end of the changelog section: just before the
/// next `## ` heading, or at end of file when the changelog is last.
fn insert_changelog_bullet(doc: &str, bullet: &str) -> String {
    let lines: Vec<&str> = doc.lines().collect();
    let heading_idx = lines
        .iter()
        .position(|line| line.trim_end() == "## Changelog");
    let mut out: Vec<String>;
    match heading_idx {
        Some(heading) => {
            let section_end = lines
                .iter()
                .skip(heading + 1)
                .position(|line| line.starts_with("## "))
                .map(|offset| heading + 1 + offset)
                .unwrap_or(lines.len());
            out = lines.iter().map(|l| l.to_string()).collect();
            // Keep the blank separator before a following heading.
            let mut insert_at = section_end;
            while insert_at > heading + 1 && out[insert_at - 1].trim().is_empty() {
                insert_at -= 1;
            }
            out.insert(insert_at, bullet.to_string());
        }
        None => {
            out = lines.iter().map(|l| l.to_string()).collect();
            if out.last().is_some_and(|l| !l.trim().is_empty()) {
                out.push(String::new());
            }
            out.push("## Changelog".to_string());
            out.push(bullet.to_string());
        }
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
