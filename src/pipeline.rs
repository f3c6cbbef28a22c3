use std::time::Duration;

use crate::config::PipelineConfig;
use crate::exec::ActionExecutor;
use crate::extract::extract_actions;
use crate::memory::MemoryStore;
use crate::model::ChatModel;
use crate::queue::{QueueStore, SeenIds};
use crate::types::{Action, ActionStatus, MemoryEntry, OutboxRecord, Prompt};
use crate::util::now_ts;

/// Recorded as the reply when every model provider failed, so the history
/// stays honest about the gap.
const NO_RESPONSE_REPLY: &str = "[no model response]";

/// Polling factor while the resource sentinel is present.
const RESOURCE_BACKOFF: u64 = 4;

/// The single-threaded prompt loop: poll the inbox, dispatch each new
/// prompt through the model, execute whatever actions come back, record
/// the outcome. One prompt is fully settled before the next is touched.
pub(crate) struct Pipeline<M: ChatModel> {
    config: PipelineConfig,
    queue: QueueStore,
    seen: SeenIds,
    memory: MemoryStore,
    executor: ActionExecutor,
    model: M,
}

impl<M: ChatModel> Pipeline<M> {
    pub(crate) fn new(config: PipelineConfig, model: M) -> Self {
        let queue = QueueStore::new(config.inbox_path(), config.outbox_path());
        let seen = SeenIds::load(config.seen_ids_path());
        let memory = MemoryStore::load(config.memory_path());
        let executor = ActionExecutor::new(&config);
        Pipeline {
            config,
            queue,
            seen,
            memory,
            executor,
            model,
        }
    }

    /// Run until the stop sentinel appears, or until the inbox is drained
    /// when `once` is set. The loop itself never fails; per-prompt errors
    /// are logged and the next prompt proceeds.
    pub(crate) fn run(&mut self, once: bool) {
        eprintln!(
            "[pipeline] watching {} (poll {}ms)",
            self.config.inbox_path().display(),
            self.config.poll_ms
        );
        loop {
            if self.config.stop_sentinel().exists() {
                eprintln!("[pipeline] stop sentinel present, shutting down");
                return;
            }
            let resource_mode = self.config.resource_sentinel().exists();
            self.poll_once(resource_mode);
            if once {
                return;
            }
            let factor = if resource_mode { RESOURCE_BACKOFF } else { 1 };
            std::thread::sleep(Duration::from_millis(self.config.poll_ms * factor));
        }
    }

    /// One inbox sweep. Returns the number of prompts dispatched.
    pub(crate) fn poll_once(&mut self, resource_mode: bool) -> usize {
        let prompts = self.queue.read_unprocessed(&self.seen);
        let mut dispatched = 0;
        for prompt in prompts {
            // A duplicate id earlier in the same sweep may have marked
            // this one already.
            if self.seen.contains(&prompt.id) {
                continue;
            }
            dispatched += 1;
            if let Err(err) = self.process_prompt(&prompt, resource_mode) {
                eprintln!("[pipeline] prompt {}: {err}", prompt.id);
            }
        }
        dispatched
    }

    fn process_prompt(
        &mut self,
        prompt: &Prompt,
        resource_mode: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        // Marked before the model sees it: a crash mid-prompt loses the
        // prompt rather than replaying its actions on restart.
        self.seen.mark(&prompt.id)?;
        eprintln!("[pipeline] processing prompt {}", prompt.id);

        // The outbox record goes out even when a later step errored: once
        // an id is marked seen it will never be polled again, so this is
        // its only chance at a record. A null action marks the failure.
        let outcome = self.dispatch(prompt, resource_mode);
        let action = outcome.as_ref().ok().cloned().flatten();
        let appended = self.queue.append_result(&OutboxRecord {
            id: prompt.id.clone(),
            action,
            timestamp: now_ts(),
        });
        outcome?;
        appended
    }

    /// Everything between intake and the outbox record: model call,
    /// extraction, execution, memory. Returns the first successfully
    /// executed action, if any.
    fn dispatch(
        &mut self,
        prompt: &Prompt,
        resource_mode: bool,
    ) -> Result<Option<Action>, Box<dyn std::error::Error>> {
        let allow_remote = self.config.allow_remote && !resource_mode;
        let reply = {
            let history = self
                .memory
                .recent(self.config.context_turns, prompt.conversation_id.as_deref());
            self.model.complete(&prompt.text, &history, allow_remote)
        };

        let roots: Vec<String> = self
            .config
            .allowed_write_roots()
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let extraction = extract_actions(reply.as_deref().unwrap_or(""), &prompt.text, &roots);

        for rejection in &extraction.rejected {
            self.executor.audit_rejection(&rejection.kind, &rejection.detail)?;
        }

        let mut first_success: Option<Action> = None;
        for action in &extraction.actions {
            let record = self.executor.execute(action)?;
            eprintln!(
                "[pipeline] {} {:?}: {}",
                record.action_type,
                record.status,
                record.filepath.as_deref().unwrap_or("-")
            );
            if record.status == ActionStatus::Success && first_success.is_none() {
                first_success = Some(action.clone());
            }
        }

        if let Some(failed_prompt) = &extraction.failure {
            self.executor.audit_extraction_failure(failed_prompt)?;
        }

        self.memory.append(MemoryEntry {
            prompt: prompt.text.clone(),
            reply: reply.unwrap_or_else(|| NO_RESPONSE_REPLY.to_string()),
            timestamp: now_ts(),
            conversation_id: prompt
                .conversation_id
                .clone()
                .unwrap_or_else(|| "general".to_string()),
        })?;

        Ok(first_success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::path::PathBuf;

    use crate::types::MemoryEntry;

    struct StubModel {
        reply: Option<String>,
        calls: Cell<usize>,
        last_allow_remote: Cell<bool>,
        last_history_len: Cell<usize>,
        last_prompt: RefCell<String>,
    }

    impl StubModel {
        fn new(reply: Option<&str>) -> Self {
            StubModel {
                reply: reply.map(|s| s.to_string()),
                calls: Cell::new(0),
                last_allow_remote: Cell::new(false),
                last_history_len: Cell::new(0),
                last_prompt: RefCell::new(String::new()),
            }
        }
    }

    impl ChatModel for StubModel {
        fn complete(
            &self,
            prompt: &str,
            history: &[&MemoryEntry],
            allow_remote: bool,
        ) -> Option<String> {
            self.calls.set(self.calls.get() + 1);
            self.last_allow_remote.set(allow_remote);
            self.last_history_len.set(history.len());
            *self.last_prompt.borrow_mut() = prompt.to_string();
            self.reply.clone()
        }
    }

    fn test_config(name: &str) -> (PipelineConfig, PathBuf) {
        let dir = std::env::temp_dir().join(format!("promptd_pipe_{}_{name}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(dir.join("state")).unwrap();
        std::fs::create_dir_all(dir.join("ws")).unwrap();
        let config = PipelineConfig {
            state_dir: dir.join("state"),
            workspace: dir.join("ws"),
            poll_ms: 10,
            context_turns: 5,
            model: "openchat".to_string(),
            model_url: "http://localhost:11434".to_string(),
            model_timeout_secs: 1,
            command_timeout_secs: 5,
            allow_remote: true,
        };
        (config, dir)
    }

    fn enqueue(config: &PipelineConfig, id: &str, text: &str) {
        let queue = QueueStore::new(config.inbox_path(), config.outbox_path());
        queue
            .append_prompt(&Prompt {
                id: id.to_string(),
                text: text.to_string(),
                timestamp: now_ts(),
                conversation_id: None,
            })
            .unwrap();
    }

    fn outbox_records(config: &PipelineConfig) -> Vec<OutboxRecord> {
        let raw = std::fs::read_to_string(config.outbox_path()).unwrap_or_default();
        raw.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_prompt_flows_through_to_outbox() {
        let (config, dir) = test_config("flow");
        let target = config.workspace.join("hello.txt");
        let reply = format!(
            r#"[{{"kind":"CreateFile","path":"{}","content":"hi","reason":"greet"}}]"#,
            target.display()
        );
        enqueue(&config, "p1", "make the greeting file");
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(Some(&reply)));
        assert_eq!(pipeline.poll_once(false), 1);

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hi");
        let records = outbox_records(&config);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "p1");
        assert!(records[0].action.is_some());
        assert_eq!(pipeline.memory.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_no_model_reply_records_sentinel_and_null_action() {
        let (config, dir) = test_config("no_reply");
        enqueue(&config, "p1", "do something vague");
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(None));
        pipeline.poll_once(false);

        let records = outbox_records(&config);
        assert_eq!(records.len(), 1);
        assert!(records[0].action.is_none());
        let recent = pipeline.memory.recent(1, None);
        assert_eq!(recent[0].reply, NO_RESPONSE_REPLY);
        // Nothing actionable anywhere: the extraction failure is on record.
        let audit = std::fs::read_to_string(config.audit_path()).unwrap();
        assert!(audit.contains("ExtractionFailed"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_prompt_fallback_fires_without_model() {
        let (config, dir) = test_config("fallback");
        let target = config.workspace.join("from_prompt.txt");
        enqueue(
            &config,
            "p1",
            &format!("create {} with content: recovered", target.display()),
        );
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(None));
        pipeline.poll_once(false);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "recovered");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_duplicate_id_dispatched_once() {
        let (config, dir) = test_config("dup");
        enqueue(&config, "p1", "first copy");
        enqueue(&config, "p1", "second copy");
        let stub = StubModel::new(Some("[]"));
        let mut pipeline = Pipeline::new(config.clone(), stub);
        assert_eq!(pipeline.poll_once(false), 1);
        assert_eq!(pipeline.model.calls.get(), 1);
        assert_eq!(outbox_records(&config).len(), 1);
        // Re-poll: nothing new.
        assert_eq!(pipeline.poll_once(false), 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_kind_rejected_and_outbox_null() {
        let (config, dir) = test_config("rejected");
        let reply = r#"[{"kind":"delete_everything","path":"/etc/passwd","content":"x"}]"#;
        enqueue(&config, "p1", "wipe it all");
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(Some(reply)));
        pipeline.poll_once(false);

        let records = outbox_records(&config);
        assert!(records[0].action.is_none());
        let audit = std::fs::read_to_string(config.audit_path()).unwrap();
        assert!(audit.contains("delete_everything"));
        assert!(audit.contains("rejected"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stop_sentinel_halts_before_processing() {
        let (config, dir) = test_config("stop");
        enqueue(&config, "p1", "never seen");
        std::fs::write(config.stop_sentinel(), "").unwrap();
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(Some("[]")));
        pipeline.run(false);
        assert_eq!(pipeline.model.calls.get(), 0);
        assert!(outbox_records(&config).is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_resource_mode_disables_remote_fallback() {
        let (config, dir) = test_config("resource");
        enqueue(&config, "p1", "anything");
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(Some("[]")));
        pipeline.poll_once(true);
        assert!(!pipeline.model.last_allow_remote.get());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_outbox_record_written_even_when_memory_save_fails() {
        let (config, dir) = test_config("memfail");
        // A directory at the memory path makes every history save fail,
        // after the prompt has already been marked seen.
        std::fs::create_dir_all(config.memory_path()).unwrap();
        enqueue(&config, "p1", "anything");
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(Some("[]")));
        pipeline.poll_once(false);

        let records = outbox_records(&config);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "p1");
        assert!(records[0].action.is_none());
        // The id stays seen: no retry, no duplicate record.
        assert_eq!(pipeline.poll_once(false), 0);
        assert_eq!(outbox_records(&config).len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_once_drains_and_returns() {
        let (config, dir) = test_config("once");
        enqueue(&config, "p1", "one");
        enqueue(&config, "p2", "two");
        let mut pipeline = Pipeline::new(config.clone(), StubModel::new(Some("[]")));
        pipeline.run(true);
        assert_eq!(outbox_records(&config).len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_context_passed_to_model() {
        let (config, dir) = test_config("context");
        enqueue(&config, "p1", "first real prompt");
        enqueue(&config, "p2", "second real prompt");
        let mut pipeline = Pipeline::new(
            config.clone(),
            StubModel::new(Some("here is a substantive reply with no json")),
        );
        pipeline.poll_once(false);
        // The second prompt sees the first exchange as history.
        assert_eq!(pipeline.model.last_history_len.get(), 1);
        assert_eq!(*pipeline.model.last_prompt.borrow(), "second real prompt");
        std::fs::remove_dir_all(&dir).ok();
    }
}
