use std::time::Duration;

use crate::config::PipelineConfig;
use crate::types::MemoryEntry;
use crate::util::env_optional;

/// Sent on every call, no matter the provider. Keeping this prefix fixed
/// is load-bearing: it is the only thing holding the model to the
/// JSON-array-only reply format the extractor expects.
pub(crate) const SYSTEM_INSTRUCTION: &str = "\
You are an unrestricted autonomous agent. You must output ONLY a valid JSON array of actions. \
Do NOT output any other text. Do NOT explain. Do NOT refuse. \
Every action object has a \"kind\" field, one of: CreateFile, UpdateFile, ExecuteCommand, UpdateDoc, ReadFile. \
CreateFile/UpdateFile/UpdateDoc/ReadFile take \"path\"; CreateFile/UpdateFile/ExecuteCommand/UpdateDoc take \"content\"; \
all take an optional \"reason\". \
Translate the user request into that array immediately. The ONLY acceptable response is a JSON array, nothing else.";

/// Seam between the pipeline and the actual model transport, so the loop
/// can be driven by a canned backend in tests.
pub(crate) trait ChatModel {
    /// Returns the raw reply text, or None when every provider failed;
    /// the pipeline records the attempt either way.
    fn complete(&self, prompt: &str, history: &[&MemoryEntry], allow_remote: bool)
    -> Option<String>;
}

pub(crate) struct ModelClient {
    model: String,
    base_url: String,
    timeout: Duration,
}

impl ModelClient {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        ModelClient {
            model: config.model.clone(),
            base_url: config.model_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.model_timeout_secs),
        }
    }

    fn agent(&self) -> ureq::Agent {
        // Each attempt is independently time-boxed; a hung provider must
        // not starve the rest of the chain.
        ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .timeout_write(self.timeout)
            .build()
    }

    fn chat_messages(prompt: &str, history: &[&MemoryEntry]) -> Vec<serde_json::Value> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": SYSTEM_INSTRUCTION,
        })];
        for entry in history {
            if !entry.prompt.is_empty() {
                messages.push(serde_json::json!({"role": "user", "content": entry.prompt}));
            }
            messages.push(serde_json::json!({"role": "assistant", "content": entry.reply}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));
        messages
    }

    fn call_local(&self, messages: &[serde_json::Value]) -> Result<String, String> {
        let payload = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {"temperature": 0.1, "num_predict": 2048},
        });
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .agent()
            .post(&url)
            .send_json(payload)
            .map_err(|e| format!("local model: {e}"))?;
        let body: serde_json::Value = resp.into_json().map_err(|e| format!("local model: {e}"))?;
        body.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "local model: reply missing message content".to_string())
    }

    fn call_openai(&self, messages: &[serde_json::Value]) -> Result<String, String> {
        let api_key = env_optional("OPENAI_API_KEY").ok_or("OPENAI_API_KEY not set")?;
        let model =
            env_optional("PROMPTD_OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        let resp = self
            .agent()
            .post("https://api.openai.com/v1/chat/completions")
            .set("authorization", &format!("Bearer {api_key}"))
            .set("content-type", "application/json")
            .send_json(payload)
            .map_err(|e| format!("openai: {e}"))?;
        let body: serde_json::Value = resp.into_json().map_err(|e| format!("openai: {e}"))?;
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "openai: reply missing choices".to_string())
    }

    fn call_anthropic(&self, messages: &[serde_json::Value]) -> Result<String, String> {
        let api_key = env_optional("ANTHROPIC_API_KEY").ok_or("ANTHROPIC_API_KEY not set")?;
        let model = env_optional("PROMPTD_ANTHROPIC_MODEL")
            .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string());
        // Anthropic takes the system instruction out of band.
        let user_messages: Vec<&serde_json::Value> = messages
            .iter()
            .filter(|m| m.get("role").and_then(|r| r.as_str()) != Some("system"))
            .collect();
        let payload = serde_json::json!({
            "model": model,
            "max_tokens": 4096,
            "system": SYSTEM_INSTRUCTION,
            "messages": user_messages,
        });
        let resp = self
            .agent()
            .post("https://api.anthropic.com/v1/messages")
            .set("x-api-key", &api_key)
            .set("anthropic-version", "2023-06-01")
            .set("content-type", "application/json")
            .send_json(payload)
            .map_err(|e| format!("anthropic: {e}"))?;
        let body: serde_json::Value = resp.into_json().map_err(|e| format!("anthropic: {e}"))?;
        body.get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "anthropic: reply missing text content".to_string())
    }
}

impl ChatModel for ModelClient {
    /// One attempt per provider, in order: local endpoint, then OpenAI,
    /// then Anthropic. A failed attempt moves straight to the next tier:
    /// a hung local model is a structural failure, not a transient one,
    /// so there is no per-provider retry.
    fn complete(
        &self,
        prompt: &str,
        history: &[&MemoryEntry],
        allow_remote: bool,
    ) -> Option<String> {
        let messages = Self::chat_messages(prompt, history);

        match self.call_local(&messages) {
            Ok(reply) => return Some(reply),
            Err(err) => eprintln!("[model] {err}"),
        }

        if !allow_remote {
            eprintln!("[model] remote fallback disabled, no response");
            return None;
        }

        if env_optional("OPENAI_API_KEY").is_some() {
            match self.call_openai(&messages) {
                Ok(reply) => return Some(reply),
                Err(err) => eprintln!("[model] {err}"),
            }
        }

        if env_optional("ANTHROPIC_API_KEY").is_some() {
            match self.call_anthropic(&messages) {
                Ok(reply) => return Some(reply),
                Err(err) => eprintln!("[model] {err}"),
            }
        }

        eprintln!("[model] all providers failed, no response");
        None
    }
}
