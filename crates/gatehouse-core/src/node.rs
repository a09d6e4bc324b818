//! Core data model: indexed nodes, scored retrieval results, strategies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Payload keys written by the indexer for internal bookkeeping. Everything
/// else in a stored point's payload belongs to the node's metadata and must
/// survive hydration.
pub const INTERNAL_KEY_PREFIX: &str = "_gh_";

/// Payload key holding the node text.
pub const TEXT_KEY: &str = "_gh_text";

/// An indexed text chunk. Created at ingestion, never mutated at serve time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub text: String,
    /// Free-form metadata. `file_name`, `file_path` and `doc_id` are
    /// preserved verbatim from ingestion.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Metadata keys excluded when building the embedding input.
    #[serde(default)]
    pub excluded_embed_metadata_keys: Vec<String>,
    /// Metadata keys excluded when rendering LLM context.
    #[serde(default)]
    pub excluded_llm_metadata_keys: Vec<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: Map::new(),
            excluded_embed_metadata_keys: Vec::new(),
            excluded_llm_metadata_keys: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn file_name(&self) -> &str {
        self.metadata
            .get("file_name")
            .and_then(|v| v.as_str())
            .unwrap_or("未知文件")
    }
}

/// Which retriever branch produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Vector,
    Keyword,
}

impl RetrievalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
        }
    }
}

/// A node with retrieval scoring attached. Ephemeral, per request.
///
/// The rerank stage may set `rerank_score` but must never drop the
/// per-branch retrieval fields or overwrite `initial_score`.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    /// Current sort key: fusion score until reranked, rerank score after.
    pub score: f64,
    pub sources: BTreeSet<RetrievalSource>,
    pub vector_score: f64,
    pub bm25_score: f64,
    pub vector_rank: Option<usize>,
    pub bm25_rank: Option<usize>,
    /// Query tokens (length >= 2) found in the node text. Present iff the
    /// keyword branch returned this node.
    pub matched_keywords: Option<Vec<String>>,
    pub initial_score: f64,
    pub rerank_score: Option<f64>,
    /// Name of the knowledge base this node came from.
    pub kb_name: String,
}

impl ScoredNode {
    pub fn id(&self) -> &str {
        &self.node.id
    }

    pub fn source_tags(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.as_str()).collect()
    }
}

/// Routing strategy: the set of knowledge bases consulted for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    General,
    VisaFree,
    Airline,
    AirlineVisaFree,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::VisaFree => "visa_free",
            Self::Airline => "airline",
            Self::AirlineVisaFree => "airline_visa_free",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical KB names as stored in the vector store.
pub mod kb_names {
    pub const GENERAL: &str = "general";
    pub const VISA_FREE: &str = "visa_free";
    pub const AIRLINE: &str = "airline";
    pub const RULES: &str = "rules";
    pub const HIDDEN: &str = "hidden";
}

/// Retrieval metadata attached to a completed response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetadata {
    pub strategy: Option<Strategy>,
    pub decomposed: bool,
    #[serde(default)]
    pub sub_questions: Vec<String>,
    #[serde(default)]
    pub sub_answers: Vec<SubAnswer>,
    pub synthesized_answer: Option<String>,
    pub fallback_reason: Option<String>,
}

/// One generated mini-answer for a sub-question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAnswer {
    pub sub_question: String,
    pub answer: String,
}

/// Deterministic candidate ordering: score desc, ties broken by node id.
pub fn sort_by_score_desc(nodes: &mut [ScoredNode]) {
    nodes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}
