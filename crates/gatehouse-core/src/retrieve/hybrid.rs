//! Hybrid retrieval with weighted Reciprocal Rank Fusion
//!
//! Fuses the dense branch (vector store) and the keyword branch (BM25) with
//! weighted RRF. Pure RRF inverts the expected order when the dense branch
//! returns near-zero similarities across the board; in that case the bypass
//! scores a node by raw BM25 magnitude so keyword ordering survives.

use super::Retriever;
use crate::bm25::Bm25Result;
use crate::config::RetrievalConfig;
use crate::embed::Embedder;
use crate::error::Result;
use crate::kb::KnowledgeBase;
use crate::node::{sort_by_score_desc, RetrievalSource, ScoredNode};
use crate::store::VectorStore;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Fusion parameters, lifted out of [`RetrievalConfig`] for the pure core.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FusionParams {
    pub k: f64,
    pub vector_weight: f64,
    pub bm25_weight: f64,
    /// Dense scores at or below this are uninformative.
    pub vector_floor: f64,
}

impl From<&RetrievalConfig> for FusionParams {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            k: config.rrf_k,
            vector_weight: config.rrf_vector_weight,
            bm25_weight: config.rrf_bm25_weight,
            vector_floor: config.vector_score_floor,
        }
    }
}

/// Dense + BM25 retriever over one knowledge base.
pub struct HybridRetriever {
    kb: Arc<KnowledgeBase>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            kb,
            store,
            embedder,
            config,
        }
    }

    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }
}

#[async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>> {
        let query_vector = self.embedder.embed(query).await?;
        let dense_hits = self
            .store
            .search(
                self.kb.collection(),
                &query_vector,
                self.config.top_k,
                None,
            )
            .await?;
        let dense: Vec<(String, f64)> = dense_hits
            .into_iter()
            .map(|hit| (hit.id, hit.score as f64))
            .collect();

        let bm25 = self.kb.bm25().search(query, self.config.top_k_bm25);

        let mut fused = fuse(&self.kb, &dense, &bm25, FusionParams::from(&self.config));
        fused.truncate(self.config.top_k_merged);

        tracing::debug!(
            kb = self.kb.name(),
            dense = dense.len(),
            bm25 = bm25.hits.len(),
            fused = fused.len(),
            "hybrid retrieval complete"
        );
        Ok(fused)
    }
}

/// Weighted RRF with the low-vector bypass. Returns nodes sorted by fused
/// score descending, ties broken by node id.
pub(crate) fn fuse(
    kb: &KnowledgeBase,
    dense: &[(String, f64)],
    bm25: &Bm25Result,
    params: FusionParams,
) -> Vec<ScoredNode> {
    struct Branches {
        vector_rank: Option<usize>,
        vector_score: f64,
        bm25_rank: Option<usize>,
        bm25_score: f64,
        matched_keywords: Option<Vec<String>>,
    }

    let mut union: HashMap<&str, Branches> = HashMap::new();

    for (rank0, (id, score)) in dense.iter().enumerate() {
        let entry = union.entry(id.as_str()).or_insert_with(|| Branches {
            vector_rank: None,
            vector_score: 0.0,
            bm25_rank: None,
            bm25_score: 0.0,
            matched_keywords: None,
        });
        entry.vector_rank = Some(rank0 + 1);
        entry.vector_score = *score;
    }

    for (rank0, hit) in bm25.hits.iter().enumerate() {
        let entry = union
            .entry(hit.node_id.as_str())
            .or_insert_with(|| Branches {
                vector_rank: None,
                vector_score: 0.0,
                bm25_rank: None,
                bm25_score: 0.0,
                matched_keywords: None,
            });
        entry.bm25_rank = Some(rank0 + 1);
        entry.bm25_score = hit.score;
        entry.matched_keywords = Some(hit.matched_keywords.clone());
    }

    let mut fused = Vec::with_capacity(union.len());
    for (id, branches) in union {
        let Some(node) = kb.get(id) else {
            continue;
        };

        let vector_valid =
            branches.vector_rank.is_some() && branches.vector_score > params.vector_floor;
        let bm25_valid = branches.bm25_rank.is_some();

        let score = if !vector_valid && bm25_valid {
            // BYPASS: keep raw BM25 magnitude when the dense branch says nothing.
            params.bm25_weight * branches.bm25_score
        } else {
            let mut s = 0.0;
            if vector_valid {
                s += params.vector_weight
                    / (params.k + branches.vector_rank.unwrap_or_default() as f64);
            }
            if bm25_valid {
                s +=
                    params.bm25_weight / (params.k + branches.bm25_rank.unwrap_or_default() as f64);
            }
            s
        };

        let mut sources = BTreeSet::new();
        if branches.vector_rank.is_some() {
            sources.insert(RetrievalSource::Vector);
        }
        if branches.bm25_rank.is_some() {
            sources.insert(RetrievalSource::Keyword);
        }

        fused.push(ScoredNode {
            node: node.clone(),
            score,
            sources,
            vector_score: branches.vector_score,
            bm25_score: branches.bm25_score,
            vector_rank: branches.vector_rank,
            bm25_rank: branches.bm25_rank,
            matched_keywords: branches.matched_keywords,
            initial_score: score,
            rerank_score: None,
            kb_name: kb.name().to_string(),
        });
    }

    sort_by_score_desc(&mut fused);
    fused
}
