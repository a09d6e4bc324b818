//! In-memory BM25 index over knowledge-base nodes
//!
//! The corpus is tokenised with jieba so CJK queries segment properly. Okapi
//! BM25 with k1=1.2, b=0.75. Nodes whose text yields no tokens are skipped at
//! build time and counted; they never enter the index silently.

use crate::node::Node;
use jieba_rs::Jieba;
use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// One keyword-branch hit.
#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub node_id: String,
    pub score: f64,
    /// Query tokens (length >= 2) present in this node's text.
    pub matched_keywords: Vec<String>,
}

/// Result of a keyword search: ranked hits plus the full query token list.
#[derive(Debug, Clone, Default)]
pub struct Bm25Result {
    pub hits: Vec<Bm25Hit>,
    pub query_keywords: Vec<String>,
}

/// Precomputed BM25 index for one knowledge base.
pub struct Bm25Index {
    jieba: Jieba,
    /// token -> postings (doc index, term frequency), doc indices ascending.
    postings: HashMap<String, Vec<(u32, u32)>>,
    doc_ids: Vec<String>,
    doc_len: Vec<u32>,
    avg_doc_len: f64,
    skipped: usize,
}

fn is_indexable(token: &str) -> bool {
    token.chars().any(|c| c.is_alphanumeric())
}

impl Bm25Index {
    /// Build the index over the node set. Untokenisable nodes are skipped
    /// and counted.
    pub fn build(nodes: &[Node]) -> Self {
        let jieba = Jieba::new();
        let mut postings: HashMap<String, Vec<(u32, u32)>> = HashMap::new();
        let mut doc_ids = Vec::new();
        let mut doc_len = Vec::new();
        let mut skipped = 0usize;

        for node in nodes {
            let tokens: Vec<String> = jieba
                .cut(&node.text, true)
                .into_iter()
                .filter(|t| is_indexable(t))
                .map(|t| t.to_lowercase())
                .collect();

            if tokens.is_empty() {
                skipped += 1;
                continue;
            }

            let doc_idx = doc_ids.len() as u32;
            doc_ids.push(node.id.clone());
            doc_len.push(tokens.len() as u32);

            let mut tf: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_default() += 1;
            }
            for (token, count) in tf {
                postings.entry(token).or_default().push((doc_idx, count));
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, "nodes skipped at BM25 index build (no tokens)");
        }

        let avg_doc_len = if doc_len.is_empty() {
            0.0
        } else {
            doc_len.iter().map(|l| *l as f64).sum::<f64>() / doc_len.len() as f64
        };

        Self {
            jieba,
            postings,
            doc_ids,
            doc_len,
            avg_doc_len,
            skipped,
        }
    }

    /// Number of nodes dropped at build time.
    pub fn skipped_count(&self) -> usize {
        self.skipped
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Segment a query the same way the corpus was segmented.
    pub fn tokenize(&self, query: &str) -> Vec<String> {
        self.jieba
            .cut(query, true)
            .into_iter()
            .filter(|t| is_indexable(t))
            .map(|t| t.to_lowercase())
            .collect()
    }

    /// Top-k BM25 search with matched-keyword tracking.
    pub fn search(&self, query: &str, top_k: usize) -> Bm25Result {
        let query_keywords = self.tokenize(query);
        if query_keywords.is_empty() || self.doc_ids.is_empty() {
            return Bm25Result {
                hits: Vec::new(),
                query_keywords,
            };
        }

        let n = self.doc_ids.len() as f64;
        let mut scores: HashMap<u32, f64> = HashMap::new();
        let mut matched: HashMap<u32, Vec<String>> = HashMap::new();

        for token in &query_keywords {
            let Some(posting) = self.postings.get(token) else {
                continue;
            };
            let df = posting.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (doc_idx, tf) in posting {
                let tf = *tf as f64;
                let dl = self.doc_len[*doc_idx as usize] as f64;
                let norm = K1 * (1.0 - B + B * dl / self.avg_doc_len);
                *scores.entry(*doc_idx).or_default() += idf * (tf * (K1 + 1.0)) / (tf + norm);

                if token.chars().count() >= 2 {
                    let keywords = matched.entry(*doc_idx).or_default();
                    if !keywords.contains(token) {
                        keywords.push(token.clone());
                    }
                }
            }
        }

        let mut hits: Vec<Bm25Hit> = scores
            .into_iter()
            .map(|(doc_idx, score)| Bm25Hit {
                node_id: self.doc_ids[doc_idx as usize].clone(),
                score,
                matched_keywords: matched.remove(&doc_idx).unwrap_or_default(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        hits.truncate(top_k);

        Bm25Result {
            hits,
            query_keywords,
        }
    }
}
