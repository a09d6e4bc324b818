//! Multi-knowledge-base retrieval with strategy quotas
//!
//! Every non-general strategy consults the general KB as a safety net; the
//! merged list takes a fixed per-KB slot from each consulted base, then fills
//! the comparative remainder from the pooled leftovers regardless of origin.

use super::Retriever;
use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::node::{sort_by_score_desc, ScoredNode, Strategy};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Composite retriever over the loaded knowledge bases.
pub struct MultiKbRetriever {
    general: Arc<dyn Retriever>,
    visa_free: Option<Arc<dyn Retriever>>,
    airline: Option<Arc<dyn Retriever>>,
    config: RetrievalConfig,
}

impl MultiKbRetriever {
    pub fn new(
        general: Arc<dyn Retriever>,
        visa_free: Option<Arc<dyn Retriever>>,
        airline: Option<Arc<dyn Retriever>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            general,
            visa_free,
            airline,
            config,
        }
    }

    /// Retrieve under a strategy. `rerank_top_n` only bounds the `general`
    /// strategy; the multi-KB templates have fixed return counts.
    pub async fn retrieve_for(
        &self,
        strategy: Strategy,
        query: &str,
        rerank_top_n: usize,
    ) -> Result<Vec<ScoredNode>> {
        match strategy {
            Strategy::General => self.retrieve_general(query, rerank_top_n).await,
            Strategy::VisaFree => {
                self.retrieve_special(
                    query,
                    &[&self.visa_free],
                    self.config.visa_free_return_count,
                )
                .await
            }
            Strategy::Airline => {
                self.retrieve_special(query, &[&self.airline], self.config.airline_return_count)
                    .await
            }
            Strategy::AirlineVisaFree => {
                self.retrieve_special(
                    query,
                    &[&self.airline, &self.visa_free],
                    self.config.airline_visa_free_return_count,
                )
                .await
            }
        }
    }

    async fn retrieve_general(&self, query: &str, rerank_top_n: usize) -> Result<Vec<ScoredNode>> {
        let mut nodes = self.general.retrieve(query).await?;
        nodes.truncate(rerank_top_n);
        Ok(nodes)
    }

    /// Query the given special KBs plus the general safety net, then merge
    /// under the slot template.
    async fn retrieve_special(
        &self,
        query: &str,
        special: &[&Option<Arc<dyn Retriever>>],
        return_count: usize,
    ) -> Result<Vec<ScoredNode>> {
        let mut futures = Vec::new();
        for retriever in special.iter().filter_map(|r| r.as_ref()) {
            futures.push(retriever.retrieve(query));
        }
        futures.push(self.general.retrieve(query));

        let results = futures::future::join_all(futures).await;
        let mut kb_lists = Vec::with_capacity(results.len());
        for result in results {
            kb_lists.push(result?);
        }

        Ok(merge_with_slots(
            kb_lists,
            self.config.kb_slot_size,
            return_count,
        ))
    }
}

/// Merge per-KB candidate lists: a fixed top slot from each list first, then
/// the best of the pooled remainder. Node ids are deduplicated throughout;
/// the first occurrence wins. Final order is score descending, ties by id.
fn merge_with_slots(
    kb_lists: Vec<Vec<ScoredNode>>,
    slot_size: usize,
    return_count: usize,
) -> Vec<ScoredNode> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut accepted: Vec<ScoredNode> = Vec::with_capacity(return_count);
    let mut remainder: Vec<ScoredNode> = Vec::new();

    for list in kb_lists {
        let mut taken = 0usize;
        for node in list {
            if seen.contains(node.id()) {
                continue;
            }
            if taken < slot_size {
                seen.insert(node.id().to_string());
                accepted.push(node);
                taken += 1;
            } else {
                remainder.push(node);
            }
        }
    }

    sort_by_score_desc(&mut remainder);
    for node in remainder {
        if accepted.len() >= return_count {
            break;
        }
        if seen.insert(node.id().to_string()) {
            accepted.push(node);
        }
    }

    sort_by_score_desc(&mut accepted);
    accepted.truncate(return_count);
    accepted
}

/// A [`MultiKbRetriever`] pinned to one strategy, so downstream stages (the
/// decomposer in particular) can be handed exactly the retriever the router
/// chose.
pub struct StrategyRetriever {
    multi: Arc<MultiKbRetriever>,
    strategy: Strategy,
    rerank_top_n: usize,
}

impl StrategyRetriever {
    pub fn new(multi: Arc<MultiKbRetriever>, strategy: Strategy, rerank_top_n: usize) -> Self {
        Self {
            multi,
            strategy,
            rerank_top_n,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

#[async_trait]
impl Retriever for StrategyRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>> {
        self.multi
            .retrieve_for(self.strategy, query, self.rerank_top_n)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, RetrievalSource};
    use std::collections::BTreeSet;

    struct FixedRetriever {
        kb_name: &'static str,
        nodes: Vec<(String, f64)>,
    }

    impl FixedRetriever {
        fn new(kb_name: &'static str, nodes: &[(&str, f64)]) -> Arc<dyn Retriever> {
            Arc::new(Self {
                kb_name,
                nodes: nodes
                    .iter()
                    .map(|(id, score)| (id.to_string(), *score))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _query: &str) -> Result<Vec<ScoredNode>> {
            Ok(self
                .nodes
                .iter()
                .map(|(id, score)| ScoredNode {
                    node: Node::new(id.clone(), format!("text {id}")),
                    score: *score,
                    sources: BTreeSet::from([RetrievalSource::Vector]),
                    vector_score: *score,
                    bm25_score: 0.0,
                    vector_rank: Some(1),
                    bm25_rank: None,
                    matched_keywords: None,
                    initial_score: *score,
                    rerank_score: None,
                    kb_name: self.kb_name.to_string(),
                })
                .collect())
        }
    }

    fn ranked(prefix: &str, count: usize, base: f64) -> Vec<(String, f64)> {
        (0..count)
            .map(|i| (format!("{prefix}{i}"), base - i as f64 * 0.01))
            .collect()
    }

    fn retriever_with(prefix: &'static str, kb: &'static str, count: usize, base: f64) -> Arc<dyn Retriever> {
        let nodes: Vec<(String, f64)> = ranked(prefix, count, base);
        let refs: Vec<(&str, f64)> = nodes.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        FixedRetriever::new(kb, &refs)
    }

    fn multi() -> MultiKbRetriever {
        MultiKbRetriever::new(
            retriever_with("g", "general", 10, 0.8),
            Some(retriever_with("v", "visa_free", 10, 0.9)),
            Some(retriever_with("a", "airline", 10, 0.7)),
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn general_strategy_respects_caller_top_n() {
        let m = multi();
        let nodes = m
            .retrieve_for(Strategy::General, "问题", 4)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 4);
        assert!(nodes.iter().all(|n| n.kb_name == "general"));
    }

    #[tokio::test]
    async fn visa_free_strategy_returns_fifteen_with_safety_net() {
        let m = multi();
        let nodes = m
            .retrieve_for(Strategy::VisaFree, "免签", 999)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 15);
        assert!(nodes.iter().any(|n| n.kb_name == "general"));
        assert!(nodes.iter().any(|n| n.kb_name == "visa_free"));
        // no airline nodes on this strategy
        assert!(nodes.iter().all(|n| n.kb_name != "airline"));
    }

    #[tokio::test]
    async fn airline_visa_free_strategy_covers_three_kbs() {
        let m = multi();
        let nodes = m
            .retrieve_for(Strategy::AirlineVisaFree, "机组免签", 999)
            .await
            .unwrap();
        assert_eq!(nodes.len(), 20);
        for kb in ["general", "visa_free", "airline"] {
            assert!(nodes.iter().any(|n| n.kb_name == kb), "missing {kb}");
        }
    }

    #[tokio::test]
    async fn merged_lists_have_no_duplicate_ids() {
        // The same node id appears in both the special and general lists.
        let shared = FixedRetriever::new("visa_free", &[("dup", 0.95), ("v1", 0.9)]);
        let general = FixedRetriever::new("general", &[("dup", 0.85), ("g1", 0.8)]);
        let m = MultiKbRetriever::new(general, Some(shared), None, RetrievalConfig::default());

        let nodes = m
            .retrieve_for(Strategy::VisaFree, "免签", 999)
            .await
            .unwrap();
        let mut ids: Vec<&str> = nodes.iter().map(|n| n.id()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
        // first occurrence wins: the visa_free copy of "dup"
        let dup = nodes.iter().find(|n| n.id() == "dup").unwrap();
        assert_eq!(dup.kb_name, "visa_free");
    }

    #[tokio::test]
    async fn final_order_is_score_desc() {
        let m = multi();
        let nodes = m
            .retrieve_for(Strategy::AirlineVisaFree, "机组免签", 999)
            .await
            .unwrap();
        for pair in nodes.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn missing_special_kb_degrades_to_general() {
        let m = MultiKbRetriever::new(
            retriever_with("g", "general", 10, 0.8),
            None,
            None,
            RetrievalConfig::default(),
        );
        let nodes = m
            .retrieve_for(Strategy::VisaFree, "免签", 999)
            .await
            .unwrap();
        assert!(!nodes.is_empty());
        assert!(nodes.iter().all(|n| n.kb_name == "general"));
    }

    #[tokio::test]
    async fn comparative_slot_pulls_best_remainder() {
        // visa_free has a very strong 6th node that should enter via the
        // comparative pool even after both 5-slots are taken.
        let visa: Vec<(String, f64)> = vec![
            ("v0".into(), 0.99),
            ("v1".into(), 0.98),
            ("v2".into(), 0.97),
            ("v3".into(), 0.96),
            ("v4".into(), 0.95),
            ("v5".into(), 0.94),
        ];
        let visa_refs: Vec<(&str, f64)> = visa.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let m = MultiKbRetriever::new(
            retriever_with("g", "general", 10, 0.5),
            Some(FixedRetriever::new("visa_free", &visa_refs)),
            None,
            RetrievalConfig::default(),
        );
        let nodes = m
            .retrieve_for(Strategy::VisaFree, "免签", 999)
            .await
            .unwrap();
        assert!(nodes.iter().any(|n| n.id() == "v5"));
    }
}
