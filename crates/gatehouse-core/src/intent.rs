//! Intent routing
//!
//! One LLM call classifies a query into a retrieval strategy. The router is a
//! silent degrader: any failure, timeout or parse miss yields `general`, and
//! results are cached on the raw query string.

use crate::cache::BoundedCache;
use crate::config::IntentConfig;
use crate::llm::{ChatMessage, ChatModel, ChatOptions, LlmRegistry};
use crate::node::Strategy;
use crate::prompts;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Classifies queries into retrieval strategies.
pub struct IntentRouter {
    llm: Option<Arc<dyn ChatModel>>,
    config: IntentConfig,
    cache: BoundedCache<String, Strategy>,
    cache_hits: AtomicU64,
    classifications: AtomicU64,
}

impl IntentRouter {
    pub fn new(registry: &LlmRegistry, config: IntentConfig) -> Self {
        let llm = if config.enabled {
            registry.get(config.llm_id.as_deref()).ok()
        } else {
            None
        };
        Self {
            cache: BoundedCache::with_capacity(config.cache_capacity),
            llm,
            config,
            cache_hits: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
        }
    }

    /// Router wired to a specific model (tests, embedded runs).
    pub fn with_model(llm: Arc<dyn ChatModel>, config: IntentConfig) -> Self {
        Self {
            cache: BoundedCache::with_capacity(config.cache_capacity),
            llm: Some(llm),
            config,
            cache_hits: AtomicU64::new(0),
            classifications: AtomicU64::new(0),
        }
    }

    /// Classify a query. Never fails; the fallback strategy is `general`.
    pub async fn classify(&self, query: &str) -> Strategy {
        if !self.config.enabled {
            return Strategy::General;
        }
        let Some(llm) = self.llm.as_ref() else {
            return Strategy::General;
        };

        if let Some(cached) = self.cache.get(&query.to_string()) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }

        self.classifications.fetch_add(1, Ordering::Relaxed);
        let messages = vec![
            ChatMessage::system(prompts::INTENT_SYSTEM),
            ChatMessage::user(prompts::intent_user(query)),
        ];
        let opts = ChatOptions::deterministic().with_max_tokens(32);

        let strategy = match tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            llm.complete(messages, &opts),
        )
        .await
        {
            Ok(Ok(reply)) => parse_strategy(&reply),
            Ok(Err(e)) => {
                tracing::warn!("intent classification failed: {e}, falling back to general");
                Strategy::General
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.config.timeout_secs,
                    "intent classification timed out, falling back to general"
                );
                Strategy::General
            }
        };

        self.cache.set(query.to_string(), strategy);
        strategy
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn classification_count(&self) -> u64 {
        self.classifications.load(Ordering::Relaxed)
    }
}

/// Parse a classifier reply. Anchors on the `分类:` label first, then falls
/// back to keyword presence; anything unparseable is `general`.
fn parse_strategy(reply: &str) -> Strategy {
    let reply = reply.trim().to_lowercase();

    let labeled = reply
        .split_once("分类:")
        .or_else(|| reply.split_once("分类："))
        .map(|(_, rest)| rest.trim());
    if let Some(token) = labeled {
        let token: String = token
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        match token.as_str() {
            "general" => return Strategy::General,
            "visa_free" => return Strategy::VisaFree,
            "airline" => return Strategy::Airline,
            "airline_visa_free" => return Strategy::AirlineVisaFree,
            _ => {}
        }
    }

    let has_airline = reply.contains("airline");
    let has_visa_free = reply.contains("visa_free");
    if has_airline && has_visa_free {
        Strategy::AirlineVisaFree
    } else if has_airline {
        Strategy::Airline
    } else if has_visa_free {
        Strategy::VisaFree
    } else {
        Strategy::General
    }
}
