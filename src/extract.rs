use crate::types::{ACTION_KINDS, Action};

/// An object that named a `kind` the executor does not know. Surfaced so
/// the pipeline can audit it as rejected instead of dropping it silently.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RejectedKind {
    pub(crate) kind: String,
    pub(crate) detail: String,
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct Extraction {
    pub(crate) actions: Vec<Action>,
    pub(crate) rejected: Vec<RejectedKind>,
    /// Set when nothing actionable could be recovered; carries the
    /// original prompt text so an operator can find and replay it.
    pub(crate) failure: Option<String>,
}

/// Phrases that mark explicit inline content in a prompt, checked in
/// order. Deliberately small: the fallback is a narrow escape hatch for
/// unambiguous file-creation requests, not a general parser.
const CONTENT_TRIGGERS: &[&str] = &["with content:", "content:", "save as ", " as "];

/// Turn a raw model reply into zero or more actions.
///
/// Three layers, each tried only when the previous produced nothing:
/// 1. strict parse of the whole reply as a JSON action array;
/// 2. brace-depth scan for embedded JSON objects carrying a `kind` field;
/// 3. path/content synthesis from the *original prompt*, CreateFile only.
///
/// Never panics on malformed input; the worst case is an empty action
/// list plus a failure record.
pub(crate) fn extract_actions(raw_text: &str, prompt_text: &str, safe_roots: &[String]) -> Extraction {
    let trimmed = raw_text.trim();

    // Step 1: the reply is exactly the JSON array we asked for.
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(trimmed)
    {
        if items.is_empty() {
            // Valid-but-empty is a successful extraction of zero actions,
            // not a failure.
            return Extraction::default();
        }
        let mut out = Extraction::default();
        for item in &items {
            match classify_object(item) {
                Classified::Action(action) => out.actions.push(action),
                Classified::Rejected(rejection) => out.rejected.push(rejection),
                Classified::NotAnAction => out.rejected.push(RejectedKind {
                    kind: "<missing>".to_string(),
                    detail: format!("array element without a kind field: {item}"),
                }),
            }
        }
        return out;
    }

    // Step 2: the reply is prose with JSON objects embedded in it.
    let mut out = scan_embedded_objects(raw_text);
    if !out.actions.is_empty() || !out.rejected.is_empty() {
        return out;
    }

    // Step 3: the model gave us nothing usable, but an explicit
    // file-creation request in the prompt itself must not be dropped.
    if let Some(path) = find_safe_path(prompt_text, safe_roots) {
        if let Some(content) = find_inline_content(prompt_text, &path) {
            let summary: String = prompt_text.chars().take(50).collect();
            out.actions.push(Action::CreateFile {
                path,
                content,
                reason: format!("explicit file request recovered from prompt: {summary}"),
            });
            return out;
        }
    }

    out.failure = Some(prompt_text.to_string());
    out
}

enum Classified {
    Action(Action),
    Rejected(RejectedKind),
    NotAnAction,
}

fn classify_object(value: &serde_json::Value) -> Classified {
    let Some(kind) = value.get("kind").and_then(|k| k.as_str()) else {
        return Classified::NotAnAction;
    };
    if !ACTION_KINDS.contains(&kind) {
        return Classified::Rejected(RejectedKind {
            kind: kind.to_string(),
            detail: format!("unrecognized action kind: {kind}"),
        });
    }
    match serde_json::from_value::<Action>(value.clone()) {
        Ok(action) => Classified::Action(action),
        Err(err) => Classified::Rejected(RejectedKind {
            kind: kind.to_string(),
            detail: format!("invalid fields for {kind}: {err}"),
        }),
    }
}

/// Raw brace-depth scan over the reply text. Every maximal balanced
/// `{...}` span is a parse candidate. This is a character counter, not a
/// JSON tokenizer: an unbalanced `}` inside a string literal closes the
/// span early and the candidate fails to parse. Accepted limitation;
/// such replies fall through to the prompt fallback.
fn scan_embedded_objects(raw_text: &str) -> Extraction {
    let mut out = Extraction::default();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    for (idx, ch) in raw_text.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        let candidate = &raw_text[begin..=idx];
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                            match classify_object(&value) {
                                Classified::Action(action) => out.actions.push(action),
                                Classified::Rejected(rejection) => out.rejected.push(rejection),
                                Classified::NotAnAction => {}
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// First whitespace-delimited token starting with one of the configured
/// safe-root prefixes, with trailing punctuation stripped.
fn find_safe_path(prompt: &str, safe_roots: &[String]) -> Option<String> {
    for root in safe_roots {
        let prefix = if root.ends_with('/') {
            root.clone()
        } else {
            format!("{root}/")
        };
        if let Some(begin) = prompt.find(&prefix) {
            let tail = &prompt[begin..];
            let end = tail
                .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
                .unwrap_or(tail.len());
            let path = tail[..end].trim_end_matches([',', '.', ';', ':', '!', '?', ')']);
            if path.len() > prefix.len() {
                return Some(path.to_string());
            }
        }
    }
    None
}

/// Text following the first matching trigger phrase. Content identical to
/// the path itself (e.g. "save hello as /tmp/x.txt") does not count.
fn find_inline_content(prompt: &str, path: &str) -> Option<String> {
    let lower = prompt.to_ascii_lowercase();
    for trigger in CONTENT_TRIGGERS {
        if let Some(begin) = lower.find(trigger) {
            let content = prompt[begin + trigger.len()..].trim();
            if !content.is_empty() && content != path {
                return Some(content.to_string());
            }
        }
    }
    None
}
