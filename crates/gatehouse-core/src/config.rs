//! Configuration management
//!
//! Every option can be set by environment variable; a YAML file may override
//! the compiled defaults before the environment is applied. A config error at
//! startup is fatal by design (the server refuses to serve).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// A single LLM endpoint entry, keyed by model id in [`LlmConfig::endpoints`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmEndpoint {
    pub api_base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub llm_model_name: String,
}

/// LLM call policy and the endpoint registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub endpoints: HashMap<String, LlmEndpoint>,
    pub default_llm_id: String,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            env_string("DEFAULT_LLM_ID", "qwen3-32b"),
            LlmEndpoint {
                api_base_url: env_string("LLM_API_BASE_URL", "http://127.0.0.1:1025/v1"),
                access_token: std::env::var("LLM_ACCESS_TOKEN").ok(),
                llm_model_name: env_string("LLM_MODEL_NAME", "qwen3-32b"),
            },
        );
        Self {
            endpoints,
            default_llm_id: env_string("DEFAULT_LLM_ID", "qwen3-32b"),
            request_timeout_secs: env_parse("LLM_REQUEST_TIMEOUT", 1800),
            max_tokens: env_parse("LLM_MAX_TOKENS", 8192),
            max_retries: env_parse("LLM_MAX_RETRIES", 2),
        }
    }
}

/// Embedding service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: env_string("EMBEDDING_URL", "http://127.0.0.1:8081/v1"),
            model: env_string("EMBEDDING_MODEL", "bge-large-zh-v1.5"),
            api_key: std::env::var("EMBEDDING_API_KEY").ok(),
            dimensions: env_parse("EMBEDDING_DIMENSIONS", 1024),
        }
    }
}

/// Rerank model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankServiceConfig {
    pub url: String,
    pub model: String,
}

impl Default for RerankServiceConfig {
    fn default() -> Self {
        Self {
            url: env_string("RERANKER_URL", "http://127.0.0.1:8082"),
            model: env_string("RERANKER_MODEL", "bge-reranker-large"),
        }
    }
}

/// Hybrid retrieval and fusion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub top_k_bm25: usize,
    pub top_k_merged: usize,
    pub reranker_input_top_n: usize,
    pub rerank_top_n: usize,
    pub rerank_score_threshold: f64,
    pub rrf_k: f64,
    pub rrf_vector_weight: f64,
    pub rrf_bm25_weight: f64,
    /// Dense scores at or below this are treated as uninformative and the
    /// BM25 bypass takes over.
    pub vector_score_floor: f64,
    pub visa_free_return_count: usize,
    pub airline_return_count: usize,
    pub airline_visa_free_return_count: usize,
    /// Per-KB slot size inside the strategy merge templates.
    pub kb_slot_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: env_parse("RETRIEVAL_TOP_K", 30),
            top_k_bm25: env_parse("RETRIEVAL_TOP_K_BM25", 30),
            top_k_merged: env_parse("RETRIEVAL_TOP_K_MERGED", 30),
            reranker_input_top_n: env_parse("RERANKER_INPUT_TOP_N", 30),
            rerank_top_n: env_parse("RERANK_TOP_N", 15),
            rerank_score_threshold: env_parse("RERANK_SCORE_THRESHOLD", 0.3),
            rrf_k: env_parse("RRF_K", 10.0),
            rrf_vector_weight: env_parse("RRF_VECTOR_WEIGHT", 0.7),
            rrf_bm25_weight: env_parse("RRF_BM25_WEIGHT", 0.3),
            vector_score_floor: 0.01,
            visa_free_return_count: env_parse("VISA_FREE_STRATEGY_RETURN_COUNT", 15),
            airline_return_count: env_parse("AIRLINE_STRATEGY_RETURN_COUNT", 15),
            airline_visa_free_return_count: env_parse("AIRLINE_VISA_FREE_STRATEGY_RETURN_COUNT", 20),
            kb_slot_size: 5,
        }
    }
}

/// Sub-question decomposition parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestionConfig {
    pub enabled: bool,
    pub complexity_threshold: usize,
    pub min_entities: usize,
    pub max_depth: usize,
    pub use_llm_judge: bool,
    pub decomp_timeout_secs: u64,
    pub sub_answer_timeout_secs: u64,
    pub synthesis_timeout_secs: u64,
    pub min_score: f64,
    pub max_empty_results: usize,
    pub history_compress_turns: usize,
    pub history_max_tokens: usize,
    pub max_parallel_retrievals: usize,
}

impl Default for SubQuestionConfig {
    fn default() -> Self {
        Self {
            enabled: env_bool("ENABLE_SUBQUESTION_DECOMPOSITION", false),
            complexity_threshold: env_parse("SUBQUESTION_COMPLEXITY_THRESHOLD", 60),
            min_entities: env_parse("SUBQUESTION_MIN_ENTITIES", 2),
            max_depth: env_parse("SUBQUESTION_MAX_DEPTH", 3),
            use_llm_judge: env_bool("SUBQUESTION_USE_LLM_JUDGE", false),
            decomp_timeout_secs: env_parse("SUBQUESTION_DECOMP_TIMEOUT", 10),
            sub_answer_timeout_secs: env_parse("SUBQUESTION_SUB_ANSWER_TIMEOUT", 15),
            synthesis_timeout_secs: env_parse("SUBQUESTION_SYNTHESIS_TIMEOUT", 30),
            min_score: env_parse("SUBQUESTION_MIN_SCORE", 0.3),
            max_empty_results: env_parse("SUBQUESTION_MAX_EMPTY_RESULTS", 2),
            history_compress_turns: env_parse("SUBQUESTION_HISTORY_COMPRESS_TURNS", 5),
            history_max_tokens: env_parse("SUBQUESTION_HISTORY_MAX_TOKENS", 500),
            max_parallel_retrievals: 3,
        }
    }
}

/// InsertBlock filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertBlockConfig {
    pub max_workers: usize,
    pub per_call_timeout_secs: u64,
    pub request_deadline_secs: u64,
}

impl Default for InsertBlockConfig {
    fn default() -> Self {
        Self {
            max_workers: env_parse("INSERTBLOCK_MAX_WORKERS", 5),
            per_call_timeout_secs: env_parse("INSERTBLOCK_TIMEOUT", 15),
            request_deadline_secs: env_parse("INSERTBLOCK_REQUEST_DEADLINE", 60),
        }
    }
}

/// Conversation persistence policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    pub collection: String,
    pub expire_days: i64,
    pub max_recent_turns: usize,
    pub max_relevant_turns: usize,
    pub recent_cache_ttl_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            collection: env_string("CONVERSATION_COLLECTION", "conversations"),
            expire_days: env_parse("CONVERSATION_EXPIRE_DAYS", 7),
            max_recent_turns: env_parse("MAX_RECENT_TURNS", 6),
            max_relevant_turns: env_parse("MAX_RELEVANT_TURNS", 3),
            recent_cache_ttl_secs: 300,
        }
    }
}

/// Intent router parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub cache_capacity: usize,
    pub llm_id: Option<String>,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            enabled: env_bool("ENABLE_INTENT_CLASSIFIER", false),
            timeout_secs: env_parse("INTENT_CLASSIFIER_TIMEOUT", 5),
            cache_capacity: env_parse("INTENT_CACHE_CAPACITY", 1000),
            llm_id: std::env::var("INTENT_CLASSIFIER_LLM_ID").ok(),
        }
    }
}

/// Feature toggles for the optional knowledge bases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub visa_free: bool,
    pub airline: bool,
    pub rules: bool,
    pub hidden_kb: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            visa_free: env_bool("ENABLE_VISA_FREE_FEATURE", false),
            airline: env_bool("ENABLE_AIRLINE_FEATURE", false),
            rules: env_bool("ENABLE_RULES_FEATURE", false),
            hidden_kb: env_bool("ENABLE_HIDDEN_KB_FEATURE", false),
        }
    }
}

/// Rules-injection gate: nodes scoring at or above `strong_threshold` are
/// always injected; the `weak_threshold` tier fills up to `max_rules` only
/// when strong hits are scarce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    pub max_rules: usize,
    pub strong_threshold: f64,
    pub weak_threshold: f64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_rules: env_parse("RULES_MAX_INJECTED", 3),
            strong_threshold: env_parse("RULES_STRONG_THRESHOLD", 0.7),
            weak_threshold: env_parse("RULES_WEAK_THRESHOLD", 0.5),
        }
    }
}

fn default_qdrant_url() -> String {
    env_string("QDRANT_URL", "http://localhost:6334")
}

fn default_auth_url() -> String {
    env_string("AUTH_SERVICE_URL", "http://localhost:8089/api/validate")
}

fn default_server_bind() -> String {
    env_string("SERVER_BIND", "127.0.0.1:5000")
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_service_url: String,
    #[serde(default = "default_server_bind")]
    pub server_bind: String,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankServiceConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub subquestion: SubQuestionConfig,
    #[serde(default)]
    pub insert_block: InsertBlockConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub rules: RulesConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            qdrant_url: default_qdrant_url(),
            auth_service_url: default_auth_url(),
            server_bind: default_server_bind(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankServiceConfig::default(),
            retrieval: RetrievalConfig::default(),
            subquestion: SubQuestionConfig::default(),
            insert_block: InsertBlockConfig::default(),
            conversation: ConversationConfig::default(),
            intent: IntentConfig::default(),
            features: FeatureFlags::default(),
            rules: RulesConfig::default(),
        }
    }
}

impl Settings {
    /// Build settings from the environment only.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Load settings from a YAML file, falling back to env defaults for
    /// missing sections. Missing file is not an error; a malformed file is.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: Settings = serde_yaml::from_str(&content)?;
            Ok(settings)
        } else {
            Ok(Self::from_env())
        }
    }

    pub fn llm_request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }
}
