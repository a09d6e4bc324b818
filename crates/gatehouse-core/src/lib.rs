//! Gatehouse Core Library
//!
//! Retrieval, routing and context-assembly pipeline for a regulatory-advisory
//! QA service (border inspection, airline crew visas, visa-free policy).
//!
//! # Features
//! - Hybrid retrieval: dense vectors + jieba-tokenised BM25, fused by
//!   weighted Reciprocal Rank Fusion with a low-vector-score bypass
//! - Multi-knowledge-base routing with fixed strategy quotas and a general-KB
//!   safety net
//! - LLM-backed intent routing, sub-question decomposition, and per-node
//!   relevance filtering
//! - Conversation persistence in a vector store with parent-linked turns

pub mod bm25;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod decompose;
pub mod embed;
pub mod error;
pub mod filter;
pub mod intent;
pub mod kb;
pub mod llm;
pub mod node;
pub mod prompts;
pub mod rerank;
pub mod retrieve;
pub mod store;

pub use config::Settings;
pub use conversation::{ConversationManager, Turn};
pub use decompose::SubQuestionDecomposer;
pub use embed::{Embedder, HttpEmbedder};
pub use error::{Error, GatehouseError, Result};
pub use filter::{FilteredNode, InsertBlockFilter};
pub use intent::IntentRouter;
pub use kb::{KbHashRegistry, KbRegistry, KnowledgeBase};
pub use llm::{ChatMessage, ChatModel, ChatOptions, LlmRegistry, OpenAiChatClient, StreamDelta};
pub use node::{Node, RetrievalMetadata, RetrievalSource, ScoredNode, Strategy};
pub use rerank::{rerank_candidates, HttpRerankModel, RerankModel};
pub use retrieve::{HybridRetriever, MultiKbRetriever, Retriever, StrategyRetriever};
pub use store::{MemoryStore, PayloadFilter, PointRecord, QdrantStore, SearchHit, VectorStore};
