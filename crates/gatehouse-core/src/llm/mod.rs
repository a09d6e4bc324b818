//! LLM integration
//!
//! Streaming chat completion against OpenAI-shaped endpoints, with the
//! optional `reasoning_content` delta channel separated from answer content.
//! Endpoints are registered per model id; callers pick one by id or fall back
//! to the configured default.

mod openai;

pub use openai::OpenAiChatClient;

use crate::config::LlmConfig;
use crate::error::{GatehouseError, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

/// Chat message for completion requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the backend for its reasoning channel where supported.
    pub enable_thinking: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 8192,
            enable_thinking: false,
        }
    }
}

impl ChatOptions {
    pub fn deterministic() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_thinking(mut self, enable: bool) -> Self {
        self.enable_thinking = enable;
        self
    }
}

/// One streamed delta. `reasoning` carries the model's dedicated
/// reasoning-content channel when the backend exposes one.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// Streaming chat completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Non-streaming completion; returns the full answer text.
    async fn complete(&self, messages: Vec<ChatMessage>, opts: &ChatOptions) -> Result<String>;

    /// Streaming completion; yields deltas chunk by chunk.
    async fn stream_chat(&self, messages: Vec<ChatMessage>, opts: &ChatOptions)
        -> Result<ChatStream>;

    fn model_name(&self) -> &str;
}

/// Registry of chat clients keyed by model id.
pub struct LlmRegistry {
    clients: HashMap<String, Arc<dyn ChatModel>>,
    default_id: String,
}

impl LlmRegistry {
    /// Build one HTTP client per configured endpoint.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut clients: HashMap<String, Arc<dyn ChatModel>> = HashMap::new();
        for (id, endpoint) in &config.endpoints {
            let client = OpenAiChatClient::new(
                endpoint.clone(),
                config.request_timeout_secs,
                config.max_retries,
            )?;
            clients.insert(id.clone(), Arc::new(client));
        }
        if !clients.contains_key(&config.default_llm_id) {
            return Err(GatehouseError::Config(format!(
                "default LLM id {} has no endpoint",
                config.default_llm_id
            )));
        }
        Ok(Self {
            clients,
            default_id: config.default_llm_id.clone(),
        })
    }

    /// Registry over pre-built clients (tests, embedded runs).
    pub fn from_clients(
        clients: HashMap<String, Arc<dyn ChatModel>>,
        default_id: impl Into<String>,
    ) -> Self {
        Self {
            clients,
            default_id: default_id.into(),
        }
    }

    /// Look up a client by id, falling back to the default.
    pub fn get(&self, model_id: Option<&str>) -> Result<Arc<dyn ChatModel>> {
        let id = model_id.unwrap_or(&self.default_id);
        self.clients
            .get(id)
            .cloned()
            .ok_or_else(|| GatehouseError::ModelNotFound(id.to_string()))
    }

    pub fn default_client(&self) -> Result<Arc<dyn ChatModel>> {
        self.get(None)
    }
}

/// Extract a JSON object or array from LLM output that may be wrapped in
/// markdown code fences or surrounding prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let body = &text[start + 3..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    let object = text
        .find('{')
        .and_then(|s| text.rfind('}').filter(|e| *e > s).map(|e| &text[s..=e]));
    let array = text
        .find('[')
        .and_then(|s| text.rfind(']').filter(|e| *e > s).map(|e| &text[s..=e]));
    match (object, array) {
        (Some(o), Some(a)) => {
            if text.find('{') < text.find('[') {
                o
            } else {
                a
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_fences() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn extract_json_finds_bare_object() {
        let raw = "prefix {\"can_answer\": true} suffix";
        assert_eq!(extract_json(raw), "{\"can_answer\": true}");
    }

    #[test]
    fn extract_json_finds_array() {
        let raw = "sub-questions: [\"q1\", \"q2\"]";
        assert_eq!(extract_json(raw), "[\"q1\", \"q2\"]");
    }

    #[test]
    fn registry_falls_back_to_default() {
        let config = LlmConfig::default();
        let registry = LlmRegistry::from_config(&config).unwrap();
        assert!(registry.get(None).is_ok());
        assert!(registry.get(Some("nonexistent")).is_err());
    }
}
