//! Vector store abstraction
//!
//! The serving pipeline talks to a Qdrant-shaped store through the
//! [`VectorStore`] trait: named collections of points with dense vectors and
//! free-form JSON payloads, cosine similarity assumed. [`memory::MemoryStore`]
//! backs tests and embedded runs.

mod memory;
mod qdrant;

pub use memory::MemoryStore;
pub use qdrant::QdrantStore;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// A stored point: stable id, dense vector, JSON payload.
#[derive(Debug, Clone)]
pub struct PointRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Map<String, Value>,
}

/// A similarity search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// Payload filter: exact keyword matches plus at most one numeric
/// less-than condition (used by conversation GC).
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub must_match: Vec<(String, Value)>,
    pub numeric_lt: Option<(String, f64)>,
}

impl PayloadFilter {
    pub fn matching(key: &str, value: impl Into<Value>) -> Self {
        Self {
            must_match: vec![(key.to_string(), value.into())],
            numeric_lt: None,
        }
    }

    pub fn and_lt(mut self, key: &str, bound: f64) -> Self {
        self.numeric_lt = Some((key.to_string(), bound));
        self
    }

    /// Whether a payload satisfies this filter (used by the in-memory store).
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        for (key, expected) in &self.must_match {
            if payload.get(key) != Some(expected) {
                return false;
            }
        }
        if let Some((key, bound)) = &self.numeric_lt {
            match payload.get(key).and_then(Value::as_f64) {
                Some(v) if v < *bound => {}
                _ => return false,
            }
        }
        true
    }
}

/// Upsert/scroll/search over named collections.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if missing (cosine distance, given dimension).
    async fn ensure_collection(&self, collection: &str, dim: usize) -> Result<()>;

    /// Drop a collection and all its points.
    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Insert or overwrite points. Point ids are the idempotency keys.
    async fn upsert(&self, collection: &str, points: Vec<PointRecord>) -> Result<()>;

    /// Nearest-neighbour search by cosine similarity.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&PayloadFilter>,
    ) -> Result<Vec<SearchHit>>;

    /// Page through points without a query vector.
    async fn scroll(
        &self,
        collection: &str,
        filter: Option<&PayloadFilter>,
        limit: usize,
    ) -> Result<Vec<PointRecord>>;

    /// Delete points by id.
    async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<()>;
}
