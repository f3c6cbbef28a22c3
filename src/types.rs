use serde::{Deserialize, Serialize};

/// One inbound user request, as it appears on an inbox line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Prompt {
    pub(crate) id: String,
    pub(crate) text: String,
    pub(crate) timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) conversation_id: Option<String>,
}

/// One outbox line: the pipeline's answer for a single prompt id.
/// `action` is null when extraction produced nothing executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OutboxRecord {
    pub(crate) id: String,
    pub(crate) action: Option<Action>,
    pub(crate) timestamp: i64,
}

fn default_conversation_id() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct MemoryEntry {
    pub(crate) prompt: String,
    pub(crate) reply: String,
    pub(crate) timestamp: i64,
    #[serde(default = "default_conversation_id")]
    pub(crate) conversation_id: String,
}

/// A structured instruction derived from model output. The tag set is
/// closed: anything else on the wire is rejected at extraction time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub(crate) enum Action {
    CreateFile {
        path: String,
        content: String,
        #[serde(default)]
        reason: String,
    },
    UpdateFile {
        path: String,
        content: String,
        #[serde(default)]
        reason: String,
        /// When present, replace the first literal occurrence of this text
        /// instead of overwriting the whole file.
        #[serde(
            default,
            rename = "oldContent",
            skip_serializing_if = "Option::is_none"
        )]
        old_content: Option<String>,
    },
    ExecuteCommand {
        content: String,
        #[serde(default)]
        reason: String,
    },
    UpdateDoc {
        path: String,
        content: String,
        #[serde(default)]
        reason: String,
    },
    ReadFile {
        path: String,
        #[serde(default)]
        reason: String,
    },
}

pub(crate) const ACTION_KINDS: &[&str] = &[
    "CreateFile",
    "UpdateFile",
    "ExecuteCommand",
    "UpdateDoc",
    "ReadFile",
];

impl Action {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Action::CreateFile { .. } => "CreateFile",
            Action::UpdateFile { .. } => "UpdateFile",
            Action::ExecuteCommand { .. } => "ExecuteCommand",
            Action::UpdateDoc { .. } => "UpdateDoc",
            Action::ReadFile { .. } => "ReadFile",
        }
    }

    pub(crate) fn path(&self) -> Option<&str> {
        match self {
            Action::CreateFile { path, .. }
            | Action::UpdateFile { path, .. }
            | Action::UpdateDoc { path, .. }
            | Action::ReadFile { path, .. } => Some(path),
            Action::ExecuteCommand { .. } => None,
        }
    }

    pub(crate) fn reason(&self) -> &str {
        match self {
            Action::CreateFile { reason, .. }
            | Action::UpdateFile { reason, .. }
            | Action::ExecuteCommand { reason, .. }
            | Action::UpdateDoc { reason, .. }
            | Action::ReadFile { reason, .. } => reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ActionStatus {
    Success,
    Failed,
    Rejected,
}

/// The permanent trace of one attempted action. Append-only; every
/// dispatch through the executor produces exactly one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AuditRecord {
    pub(crate) timestamp: i64,
    pub(crate) action_type: String,
    pub(crate) filepath: Option<String>,
    pub(crate) reason: String,
    pub(crate) status: ActionStatus,
    pub(crate) details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tag_round_trip() {
        let raw = r#"{"kind":"CreateFile","path":"/tmp/y.txt","content":"abc","reason":"demo"}"#;
        let action: Action = serde_json::from_str(raw).unwrap();
        assert_eq!(action.kind_name(), "CreateFile");
        assert_eq!(action.path(), Some("/tmp/y.txt"));
        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded["kind"], "CreateFile");
        assert_eq!(encoded["content"], "abc");
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let raw = r#"{"kind":"delete_everything","path":"/etc/passwd"}"#;
        assert!(serde_json::from_str::<Action>(raw).is_err());
    }

    #[test]
    fn test_update_file_old_content_optional() {
        let raw = r#"{"kind":"UpdateFile","path":"a.txt","content":"new"}"#;
        let action: Action = serde_json::from_str(raw).unwrap();
        match action {
            Action::UpdateFile { old_content, .. } => assert!(old_content.is_none()),
            other => panic!("unexpected action: {other:?}"),
        }
        let raw = r#"{"kind":"UpdateFile","path":"a.txt","content":"new","oldContent":"old"}"#;
        let action: Action = serde_json::from_str(raw).unwrap();
        match action {
            Action::UpdateFile { old_content, .. } => {
                assert_eq!(old_content.as_deref(), Some("old"))
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_prompt_conversation_id_optional_on_wire() {
        let raw = r#"{"id":"p1","text":"hello","timestamp":1}"#;
        let prompt: Prompt = serde_json::from_str(raw).unwrap();
        assert!(prompt.conversation_id.is_none());
        let encoded = serde_json::to_string(&prompt).unwrap();
        assert!(!encoded.contains("conversation_id"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ActionStatus::Rejected).unwrap(),
            "\"rejected\""
        );
    }
}
