//! Multi-turn conversation management
//!
//! Turns are persisted as vector-store points in a dedicated collection, one
//! point per turn, embedded from the concatenated user/assistant texts. The
//! manager is best-effort on writes: a failed write is logged, the user
//! response is never failed for it.

use crate::cache::BoundedCache;
use crate::config::ConversationConfig;
use crate::embed::Embedder;
use crate::error::{GatehouseError, Result};
use crate::llm::ChatMessage;
use crate::prompts;
use crate::store::{PayloadFilter, PointRecord, VectorStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Internal numeric timestamp key, used for GC range filtering.
const TS_KEY: &str = "_gh_ts";

/// Scroll cap when rebuilding a session's recent history.
const SESSION_SCROLL_LIMIT: usize = 100;

/// Scroll cap for one GC sweep.
const GC_SCROLL_LIMIT: usize = 10_000;

/// Approximate token count where no real tokenizer is available (2 chars per
/// token).
pub fn approx_token_count(text: &str) -> usize {
    text.chars().count() / 2
}

/// One persisted conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub parent_turn_id: Option<String>,
    pub session_id: String,
    pub user_query: String,
    pub assistant_response: String,
    pub timestamp: DateTime<Utc>,
    pub context_docs: Vec<String>,
    pub token_count: usize,
}

impl Turn {
    fn embedding_text(&self) -> String {
        format!("用户: {}\n助手: {}", self.user_query, self.assistant_response)
    }

    fn payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("session_id".to_string(), json!(self.session_id));
        payload.insert("user_query".to_string(), json!(self.user_query));
        payload.insert(
            "assistant_response".to_string(),
            json!(self.assistant_response),
        );
        payload.insert("timestamp".to_string(), json!(self.timestamp.to_rfc3339()));
        payload.insert("context_docs".to_string(), json!(self.context_docs));
        payload.insert("token_count".to_string(), json!(self.token_count));
        payload.insert("turn_id".to_string(), json!(self.turn_id));
        payload.insert("parent_turn_id".to_string(), json!(self.parent_turn_id));
        payload.insert(
            TS_KEY.to_string(),
            json!(self.timestamp.timestamp_millis() as f64),
        );
        payload
    }

    fn from_payload(payload: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            turn_id: payload.get("turn_id")?.as_str()?.to_string(),
            parent_turn_id: payload
                .get("parent_turn_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            session_id: payload.get("session_id")?.as_str()?.to_string(),
            user_query: payload.get("user_query")?.as_str()?.to_string(),
            assistant_response: payload.get("assistant_response")?.as_str()?.to_string(),
            timestamp: payload
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))?,
            context_docs: payload
                .get("context_docs")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            token_count: payload
                .get("token_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize,
        })
    }
}

/// Stores and retrieves conversation turns; assembles the LLM message list.
pub struct ConversationManager {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: ConversationConfig,
    recent_cache: BoundedCache<String, Vec<Turn>>,
}

impl ConversationManager {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: ConversationConfig,
    ) -> Self {
        let recent_cache = BoundedCache::with_capacity_and_ttl(
            1024,
            Duration::from_secs(config.recent_cache_ttl_secs),
        );
        Self {
            store,
            embedder,
            config,
            recent_cache,
        }
    }

    /// Create the conversations collection if missing.
    pub async fn ensure_collection(&self) -> Result<()> {
        self.store
            .ensure_collection(&self.config.collection, self.embedder.dimensions())
            .await
    }

    /// Persist one turn. The parent is the session's most recent turn unless
    /// a caller override is given; an override must belong to the session.
    /// Returns the new turn id.
    pub async fn add_turn(
        &self,
        session_id: &str,
        user_query: &str,
        assistant_response: &str,
        context_docs: Vec<String>,
        parent_override: Option<String>,
    ) -> Result<String> {
        let parent_turn_id = match parent_override {
            Some(parent) => {
                let turns = self.session_turns(session_id).await?;
                if !turns.iter().any(|t| t.turn_id == parent) {
                    return Err(GatehouseError::Parse(format!(
                        "parent turn {parent} does not belong to session {session_id}"
                    )));
                }
                Some(parent)
            }
            None => self
                .session_turns(session_id)
                .await?
                .last()
                .map(|t| t.turn_id.clone()),
        };

        let combined = format!("{user_query}{assistant_response}");
        let turn = Turn {
            turn_id: Uuid::new_v4().to_string(),
            parent_turn_id,
            session_id: session_id.to_string(),
            user_query: user_query.to_string(),
            assistant_response: assistant_response.to_string(),
            timestamp: Utc::now(),
            context_docs,
            token_count: approx_token_count(&combined),
        };

        let vector = self.embedder.embed(&turn.embedding_text()).await?;
        let point = PointRecord {
            id: turn.turn_id.clone(),
            vector,
            payload: turn.payload(),
        };
        self.store
            .upsert(&self.config.collection, vec![point])
            .await?;

        self.recent_cache.invalidate(&session_id.to_string());
        tracing::info!(session_id, turn_id = %turn.turn_id, "conversation turn stored");
        Ok(turn.turn_id)
    }

    /// All turns of a session in chronological order (oldest first), capped
    /// at the scroll limit. Served from the recent cache when warm.
    async fn session_turns(&self, session_id: &str) -> Result<Vec<Turn>> {
        if let Some(cached) = self.recent_cache.get(&session_id.to_string()) {
            return Ok(cached);
        }

        let filter = PayloadFilter::matching("session_id", session_id);
        let points = self
            .store
            .scroll(&self.config.collection, Some(&filter), SESSION_SCROLL_LIMIT)
            .await?;

        let mut turns: Vec<Turn> = points
            .iter()
            .filter_map(|p| Turn::from_payload(&p.payload))
            .collect();
        turns.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        self.recent_cache.set(session_id.to_string(), turns.clone());
        Ok(turns)
    }

    /// Last `n` turns, chronological (oldest first). Read failures degrade
    /// to no history.
    pub async fn recent(&self, session_id: &str, n: usize) -> Vec<Turn> {
        match self.session_turns(session_id).await {
            Ok(turns) => {
                let skip = turns.len().saturating_sub(n);
                turns.into_iter().skip(skip).collect()
            }
            Err(e) => {
                tracing::warn!(session_id, "recent-history read failed: {e}");
                Vec::new()
            }
        }
    }

    /// Top-k vector-similar turns within the session.
    pub async fn relevant(&self, session_id: &str, query: &str, k: usize) -> Vec<Turn> {
        let result: Result<Vec<Turn>> = async {
            let vector = self.embedder.embed(query).await?;
            let filter = PayloadFilter::matching("session_id", session_id);
            let hits = self
                .store
                .search(&self.config.collection, &vector, k, Some(&filter))
                .await?;
            Ok(hits
                .iter()
                .filter_map(|h| Turn::from_payload(&h.payload))
                .collect())
        }
        .await;

        match result {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(session_id, "relevant-history read failed: {e}");
                Vec::new()
            }
        }
    }

    /// Assemble the full LLM message list in the fixed order: system prompt,
    /// relevant history, recent history, regulations, synthesized
    /// sub-answers, current user message.
    pub async fn build_messages(
        &self,
        session_id: &str,
        system_prompt: &str,
        knowledge_context: Option<&str>,
        synthesized_answer: Option<&str>,
        current_user_msg: &str,
    ) -> Vec<ChatMessage> {
        let recent = self
            .recent(session_id, self.config.max_recent_turns)
            .await;
        let relevant = self
            .relevant(session_id, current_user_msg, self.config.max_relevant_turns)
            .await;

        // Recent turns are the later occurrences; drop relevant duplicates.
        let recent_queries: HashSet<&str> =
            recent.iter().map(|t| t.user_query.as_str()).collect();
        let unique_relevant: Vec<&Turn> = relevant
            .iter()
            .filter(|t| !recent_queries.contains(t.user_query.as_str()))
            .collect();

        let mut messages = vec![ChatMessage::system(system_prompt)];

        if !unique_relevant.is_empty() {
            messages.push(ChatMessage::system(prompts::PREFIX_RELEVANT_HISTORY));
            for turn in unique_relevant {
                messages.push(ChatMessage::user(turn.user_query.clone()));
                messages.push(ChatMessage::assistant(turn.assistant_response.clone()));
            }
        }

        if !recent.is_empty() {
            messages.push(ChatMessage::system(prompts::PREFIX_RECENT_HISTORY));
            for turn in &recent {
                messages.push(ChatMessage::user(turn.user_query.clone()));
                messages.push(ChatMessage::assistant(turn.assistant_response.clone()));
            }
        }

        if let Some(context) = knowledge_context.filter(|c| !c.is_empty()) {
            messages.push(ChatMessage::system(format!(
                "{}{context}",
                prompts::PREFIX_REGULATIONS
            )));
        }

        if let Some(synthesized) = synthesized_answer.filter(|s| !s.is_empty()) {
            messages.push(ChatMessage::system(format!(
                "{}{synthesized}",
                prompts::PREFIX_SYNTHESIZED
            )));
        }

        messages.push(ChatMessage::user(current_user_msg.to_string()));
        messages
    }

    /// Delete all turns older than `expiry_days`. Returns the number of
    /// deleted turns and invalidates the entire recent cache.
    pub async fn gc(&self, expiry_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(expiry_days);
        let filter = PayloadFilter::default()
            .and_lt(TS_KEY, cutoff.timestamp_millis() as f64);

        let expired = self
            .store
            .scroll(&self.config.collection, Some(&filter), GC_SCROLL_LIMIT)
            .await?;
        let ids: Vec<String> = expired.iter().map(|p| p.id.clone()).collect();
        if !ids.is_empty() {
            self.store
                .delete_points(&self.config.collection, &ids)
                .await?;
        }

        self.recent_cache.clear();
        tracing::info!(deleted = ids.len(), expiry_days, "conversation GC complete");
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Deterministic embedder: hashes chars into a small vector.
    struct ToyEmbedder;

    #[async_trait]
    impl Embedder for ToyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; 8];
            for (i, c) in text.chars().enumerate() {
                v[i % 8] += (c as u32 % 97) as f32;
            }
            Ok(v)
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn model_name(&self) -> &str {
            "toy"
        }
    }

    async fn manager() -> ConversationManager {
        let store = Arc::new(MemoryStore::new());
        let manager = ConversationManager::new(
            store,
            Arc::new(ToyEmbedder),
            ConversationConfig {
                collection: "conversations".to_string(),
                expire_days: 7,
                max_recent_turns: 6,
                max_relevant_turns: 3,
                recent_cache_ttl_secs: 300,
            },
        );
        manager.ensure_collection().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn first_turn_has_null_parent() {
        let m = manager().await;
        m.add_turn("1001_s", "如何办理护照？", "需要携带身份证……", vec![], None)
            .await
            .unwrap();
        let turns = m.recent("1001_s", 10).await;
        assert_eq!(turns.len(), 1);
        assert!(turns[0].parent_turn_id.is_none());
    }

    #[tokio::test]
    async fn parent_chain_links_sequential_turns() {
        let m = manager().await;
        let first = m
            .add_turn("1001_s", "问题一", "回答一", vec![], None)
            .await
            .unwrap();
        let _second = m
            .add_turn("1001_s", "问题二", "回答二", vec![], None)
            .await
            .unwrap();

        let turns = m.recent("1001_s", 10).await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].user_query, "问题一");
        assert_eq!(turns[1].parent_turn_id.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn parent_override_must_belong_to_session() {
        let m = manager().await;
        let first = m
            .add_turn("1001_s", "问题一", "回答一", vec![], None)
            .await
            .unwrap();

        // branching from an explicit parent in the same session works
        m.add_turn("1001_s", "分支问题", "分支回答", vec![], Some(first.clone()))
            .await
            .unwrap();

        // a foreign parent id is rejected
        let err = m
            .add_turn("2002_t", "问题", "回答", vec![], Some(first))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn add_turn_then_recent_returns_it_last() {
        let m = manager().await;
        m.add_turn("1001_s", "早的问题", "早的回答", vec![], None)
            .await
            .unwrap();
        m.add_turn("1001_s", "新的问题", "新的回答", vec![], None)
            .await
            .unwrap();

        let turns = m.recent("1001_s", 2).await;
        assert_eq!(turns.last().unwrap().user_query, "新的问题");
    }

    #[tokio::test]
    async fn recent_is_scoped_to_session() {
        let m = manager().await;
        m.add_turn("1001_s", "甲", "a", vec![], None).await.unwrap();
        m.add_turn("2002_t", "乙", "b", vec![], None).await.unwrap();

        let turns = m.recent("1001_s", 10).await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_query, "甲");
    }

    #[tokio::test]
    async fn message_assembly_order_and_dedup() {
        let m = manager().await;
        m.add_turn("1001_s", "历史问题", "历史回答", vec![], None)
            .await
            .unwrap();

        let messages = m
            .build_messages(
                "1001_s",
                "系统提示",
                Some("规定正文"),
                Some("综合分析"),
                "当前问题",
            )
            .await;

        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "系统提示");
        // the single stored turn appears in both relevant and recent result
        // sets; dedup must keep only the recent copy
        let history_pairs = messages
            .iter()
            .filter(|m| m.content == "历史问题")
            .count();
        assert_eq!(history_pairs, 1);

        let regs_idx = messages
            .iter()
            .position(|m| m.content.contains("规定正文"))
            .unwrap();
        let synth_idx = messages
            .iter()
            .position(|m| m.content.contains("综合分析"))
            .unwrap();
        assert!(regs_idx < synth_idx);
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert_eq!(last.content, "当前问题");
    }

    #[tokio::test]
    async fn gc_removes_expired_turns_only() {
        let m = manager().await;
        m.add_turn("1001_s", "新问题", "新回答", vec![], None)
            .await
            .unwrap();

        // plant an already-expired point directly
        let old = Turn {
            turn_id: Uuid::new_v4().to_string(),
            parent_turn_id: None,
            session_id: "1001_s".to_string(),
            user_query: "旧问题".to_string(),
            assistant_response: "旧回答".to_string(),
            timestamp: Utc::now() - ChronoDuration::days(30),
            context_docs: vec![],
            token_count: 4,
        };
        m.store
            .upsert(
                "conversations",
                vec![PointRecord {
                    id: old.turn_id.clone(),
                    vector: vec![0.0; 8],
                    payload: old.payload(),
                }],
            )
            .await
            .unwrap();
        m.recent_cache.clear();

        let deleted = m.gc(7).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = m.recent("1001_s", 10).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].user_query, "新问题");
    }

    #[tokio::test]
    async fn token_count_is_half_the_chars() {
        let m = manager().await;
        m.add_turn("1001_s", "一二三四", "五六七八", vec![], None)
            .await
            .unwrap();
        let turns = m.recent("1001_s", 1).await;
        assert_eq!(turns[0].token_count, 4);
    }
}
