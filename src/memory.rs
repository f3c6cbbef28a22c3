use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::MemoryEntry;

/// Prompts starting with this marker are agent self-notes; a short one is
/// a truncated note and gets pruned.
const SELF_NOTE_MARKER: &str = "[SELF-NOTE]";
const SELF_NOTE_MIN_LEN: usize = 20;

const FILLER_REPLIES: &[&str] = &[
    "ok", "thanks", "thank you", "cool", "nice", "yes", "no", "hmm", "huh", "lol", "test",
    "testing", "ping", "hello", "hi", "hey",
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryDocument {
    #[serde(default)]
    history: Vec<MemoryEntry>,
}

/// Durable prompt/reply history backing context building. Single JSON
/// document on disk; the junk filter re-runs over the whole collection
/// after every append so context never sees a known-junk entry.
pub(crate) struct MemoryStore {
    path: PathBuf,
    doc: MemoryDocument,
}

impl MemoryStore {
    /// A corrupt document is replaced with an empty one, logged as a
    /// recovered error. Empty memory beats refusing to start.
    pub(crate) fn load(path: PathBuf) -> Self {
        let doc = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<MemoryDocument>(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    eprintln!("[memory] store corrupt, recovered as empty: {err}");
                    MemoryDocument::default()
                }
            },
            Err(_) => MemoryDocument::default(),
        };
        MemoryStore { path, doc }
    }

    pub(crate) fn append(&mut self, entry: MemoryEntry) -> Result<(), Box<dyn std::error::Error>> {
        self.doc.history.push(entry);
        self.prune();
        self.save()
    }

    /// Up to the last `n` entries in insertion order, optionally scoped to
    /// one conversation.
    pub(crate) fn recent(&self, n: usize, conversation_id: Option<&str>) -> Vec<&MemoryEntry> {
        let filtered: Vec<&MemoryEntry> = self
            .doc
            .history
            .iter()
            .filter(|e| conversation_id.is_none_or(|cid| e.conversation_id == cid))
            .collect();
        let skip = filtered.len().saturating_sub(n);
        filtered.into_iter().skip(skip).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.doc.history.len()
    }

    pub(crate) fn clear(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.doc.history.clear();
        self.save()
    }

    /// Junk filter followed by duplicate removal (keep the latest
    /// occurrence of each prompt/reply pair). Both passes are fixed
    /// points: running them twice equals running them once.
    fn prune(&mut self) {
        self.doc.history.retain(|entry| !is_junk(entry));

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut kept_rev = Vec::new();
        for entry in self.doc.history.iter().rev() {
            let key = (entry.prompt.clone(), entry.reply.clone());
            if seen.insert(key) {
                kept_rev.push(entry.clone());
            }
        }
        kept_rev.reverse();
        self.doc.history = kept_rev;
    }

    fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        fs::write(&self.path, serde_json::to_vec_pretty(&self.doc)?)?;
        Ok(())
    }
}

/// Low-information entries: empty reply, a bare filler reply (optional
/// trailing punctuation), or a truncated self-note prompt.
pub(crate) fn is_junk(entry: &MemoryEntry) -> bool {
    let reply = entry.reply.trim();
    if reply.is_empty() {
        return true;
    }
    let normalized = reply.trim_end_matches(['.', '!']).to_ascii_lowercase();
    if FILLER_REPLIES.contains(&normalized.as_str()) {
        return true;
    }
    let prompt = entry.prompt.trim();
    prompt.starts_with(SELF_NOTE_MARKER) && prompt.len() < SELF_NOTE_MARKER.len() + SELF_NOTE_MIN_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ts;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("promptd_memory_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("mem_{}_{name}.json", std::process::id()))
    }

    fn entry(prompt: &str, reply: &str) -> MemoryEntry {
        MemoryEntry {
            prompt: prompt.to_string(),
            reply: reply.to_string(),
            timestamp: now_ts(),
            conversation_id: "general".to_string(),
        }
    }

    #[test]
    fn test_append_and_recent() {
        let path = temp_path("append");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        store.append(entry("first prompt", "a real reply")).unwrap();
        store.append(entry("second prompt", "another reply")).unwrap();
        let recent = store.recent(1, None);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].prompt, "second prompt");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_recent_on_empty_history() {
        let path = temp_path("empty");
        let _ = std::fs::remove_file(&path);
        let store = MemoryStore::load(path.clone());
        assert!(store.recent(10, None).is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_filler_reply_pruned_after_append() {
        let path = temp_path("filler");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        store.append(entry("say ok", "ok")).unwrap();
        assert!(store.recent(10, None).is_empty());
        store.append(entry("say ok loudly", "OK!")).unwrap();
        assert!(store.recent(10, None).is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_truncated_self_note_pruned() {
        let path = temp_path("self_note");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        store.append(entry("[SELF-NOTE] short", "body")).unwrap();
        assert!(store.recent(10, None).is_empty());
        store
            .append(entry(
                "[SELF-NOTE] a sufficiently long self note to keep",
                "body",
            ))
            .unwrap();
        assert_eq!(store.recent(10, None).len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_junk_filter_is_fixed_point() {
        let path = temp_path("fixed_point");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        store.append(entry("a", "kept reply one")).unwrap();
        store.append(entry("b", "ok")).unwrap();
        store.append(entry("c", "kept reply two")).unwrap();
        let before: Vec<MemoryEntry> = store.recent(10, None).into_iter().cloned().collect();
        store.prune();
        let after: Vec<MemoryEntry> = store.recent(10, None).into_iter().cloned().collect();
        assert_eq!(before, after);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_duplicates_keep_latest() {
        let path = temp_path("dedup");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        store.append(entry("same", "same reply")).unwrap();
        store.append(entry("between", "other reply")).unwrap();
        store.append(entry("same", "same reply")).unwrap();
        let recent = store.recent(10, None);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].prompt, "between");
        assert_eq!(recent[1].prompt, "same");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_conversation_scoping() {
        let path = temp_path("scope");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        let mut scoped = entry("scoped prompt", "scoped reply");
        scoped.conversation_id = "thread-1".to_string();
        store.append(scoped).unwrap();
        store.append(entry("general prompt", "general reply")).unwrap();
        let recent = store.recent(10, Some("thread-1"));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].prompt, "scoped prompt");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_store_recovers_empty() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "{{{{").unwrap();
        let store = MemoryStore::load(path.clone());
        assert_eq!(store.len(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_survives_reload() {
        let path = temp_path("reload");
        let _ = std::fs::remove_file(&path);
        let mut store = MemoryStore::load(path.clone());
        store.append(entry("persist me", "a durable reply")).unwrap();
        let reloaded = MemoryStore::load(path.clone());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.recent(1, None)[0].reply, "a durable reply");
        std::fs::remove_file(&path).ok();
    }
}
