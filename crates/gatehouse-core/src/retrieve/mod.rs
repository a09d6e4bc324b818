//! Retrieval pipeline
//!
//! A [`Retriever`] returns ranked [`ScoredNode`]s for a query. The hybrid
//! retriever fuses dense and BM25 branches per knowledge base; the multi-KB
//! retriever composes hybrid retrievers under the strategy quota templates.

mod hybrid;
mod multi_kb;

pub use hybrid::HybridRetriever;
pub use multi_kb::{MultiKbRetriever, StrategyRetriever};

use crate::error::Result;
use crate::node::ScoredNode;
use async_trait::async_trait;

/// Anything that can answer a query with a ranked candidate list.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>>;
}
