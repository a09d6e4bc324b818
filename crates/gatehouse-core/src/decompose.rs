//! Sub-question decomposition
//!
//! Complex queries are split into 2-3 sub-questions, retrieved in parallel on
//! the retriever the intent router chose, answered individually, merged, and
//! optionally synthesised into one consolidated passage for the final prompt.
//! Every failure path degrades to a standard retrieve on the same retriever.

use crate::config::SubQuestionConfig;
use crate::conversation::Turn;
use crate::error::Result;
use crate::llm::{extract_json, ChatMessage, ChatModel, ChatOptions};
use crate::node::{sort_by_score_desc, RetrievalMetadata, ScoredNode, SubAnswer};
use crate::prompts;
use crate::retrieve::Retriever;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Characters treated as entity separators by the cheap complexity gate.
const ENTITY_SEPARATORS: [char; 6] = ['，', '、', '和', '以', '及', '与'];

/// Counters tracked across the decomposer's lifetime. Nothing is persisted.
#[derive(Default)]
pub struct DecomposerMetrics {
    pub total_queries: AtomicU64,
    pub decomposed_queries: AtomicU64,
    pub fallback_count: AtomicU64,
    pub empty_results_count: AtomicU64,
    pub timeout_count: AtomicU64,
    pub error_count: AtomicU64,
}

/// Point-in-time snapshot of [`DecomposerMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub decomposed_queries: u64,
    pub fallback_count: u64,
    pub empty_results_count: u64,
    pub timeout_count: u64,
    pub error_count: u64,
}

impl DecomposerMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            decomposed_queries: self.decomposed_queries.load(Ordering::Relaxed),
            fallback_count: self.fallback_count.load(Ordering::Relaxed),
            empty_results_count: self.empty_results_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

struct SubResult {
    sub_question: String,
    nodes: Vec<ScoredNode>,
}

/// Splits complex queries and fans retrieval out over the sub-questions.
pub struct SubQuestionDecomposer {
    llm: Arc<dyn ChatModel>,
    config: SubQuestionConfig,
    metrics: DecomposerMetrics,
}

impl SubQuestionDecomposer {
    pub fn new(llm: Arc<dyn ChatModel>, config: SubQuestionConfig) -> Self {
        Self {
            llm,
            config,
            metrics: DecomposerMetrics::default(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Cheap complexity gate: length plus separator-based entity indicators.
    pub fn should_decompose(&self, query: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        if query.chars().count() < self.config.complexity_threshold {
            return false;
        }
        let entity_indicators = query
            .chars()
            .filter(|c| ENTITY_SEPARATORS.contains(c))
            .count();
        entity_indicators >= self.config.min_entities
    }

    /// Retrieve with decomposition, falling back to `retriever.retrieve` on
    /// any failure. The router runs before this and passes its chosen
    /// retriever; the decomposer never picks knowledge bases itself.
    pub async fn retrieve_with_decomposition(
        &self,
        query: &str,
        rerank_top_n: usize,
        conversation_history: Option<&[Turn]>,
        retriever: &dyn Retriever,
    ) -> Result<(Vec<ScoredNode>, RetrievalMetadata)> {
        self.metrics.total_queries.fetch_add(1, Ordering::Relaxed);

        let wants_decomposition = if self.should_decompose(query) {
            true
        } else if self.config.enabled && self.config.use_llm_judge {
            self.llm_judges_multifaceted(query).await
        } else {
            false
        };

        if !wants_decomposition {
            let nodes = self.standard_retrieve(query, rerank_top_n, retriever).await?;
            return Ok((nodes, RetrievalMetadata::default()));
        }

        let history_summary = match conversation_history {
            Some(turns) if !turns.is_empty() => self.compress_history(turns).await,
            _ => String::new(),
        };

        let sub_questions = match self.decompose(query, &history_summary).await {
            Ok(subs) => subs,
            Err(reason) => {
                self.metrics.fallback_count.fetch_add(1, Ordering::Relaxed);
                let nodes = self.standard_retrieve(query, rerank_top_n, retriever).await?;
                let metadata = RetrievalMetadata {
                    fallback_reason: Some(reason),
                    ..Default::default()
                };
                return Ok((nodes, metadata));
            }
        };

        if sub_questions.is_empty() {
            self.metrics.fallback_count.fetch_add(1, Ordering::Relaxed);
            let nodes = self.standard_retrieve(query, rerank_top_n, retriever).await?;
            let metadata = RetrievalMetadata {
                fallback_reason: Some("empty_decomposition".to_string()),
                ..Default::default()
            };
            return Ok((nodes, metadata));
        }

        if sub_questions.len() == 1 {
            // A single sub-question is the original query in disguise.
            let nodes = self.standard_retrieve(query, rerank_top_n, retriever).await?;
            let metadata = RetrievalMetadata {
                decomposed: true,
                sub_questions,
                ..Default::default()
            };
            return Ok((nodes, metadata));
        }

        self.metrics
            .decomposed_queries
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            count = sub_questions.len(),
            "retrieving sub-questions in parallel"
        );

        let sub_results = self
            .parallel_retrieve(&sub_questions, rerank_top_n, retriever)
            .await;

        let empty_count = sub_results.iter().filter(|r| r.nodes.is_empty()).count();
        if empty_count >= self.config.max_empty_results {
            self.metrics
                .empty_results_count
                .fetch_add(1, Ordering::Relaxed);
            self.metrics.fallback_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                empty_count,
                total = sub_results.len(),
                "too many empty sub-results, falling back to standard retrieval"
            );
            let nodes = self.standard_retrieve(query, rerank_top_n, retriever).await?;
            let metadata = RetrievalMetadata {
                sub_questions,
                fallback_reason: Some("too_many_empty_results".to_string()),
                ..Default::default()
            };
            return Ok((nodes, metadata));
        }

        let merged = self.merge_sub_results(&sub_results, rerank_top_n);
        let sub_answers = self.generate_sub_answers(&sub_results).await;
        let synthesized_answer = if sub_answers.is_empty() {
            None
        } else {
            self.synthesize(query, &sub_answers).await
        };

        let metadata = RetrievalMetadata {
            strategy: None,
            decomposed: true,
            sub_questions,
            sub_answers,
            synthesized_answer,
            fallback_reason: None,
        };
        Ok((merged, metadata))
    }

    async fn standard_retrieve(
        &self,
        query: &str,
        rerank_top_n: usize,
        retriever: &dyn Retriever,
    ) -> Result<Vec<ScoredNode>> {
        let mut nodes = retriever.retrieve(query).await?;
        nodes.truncate(rerank_top_n);
        Ok(nodes)
    }

    async fn llm_judges_multifaceted(&self, query: &str) -> bool {
        let messages = vec![
            ChatMessage::system(prompts::DECOMPOSE_JUDGE_SYSTEM),
            ChatMessage::user(query.to_string()),
        ];
        let opts = ChatOptions::deterministic().with_max_tokens(8);
        match tokio::time::timeout(
            Duration::from_secs(self.config.decomp_timeout_secs),
            self.llm.complete(messages, &opts),
        )
        .await
        {
            Ok(Ok(reply)) => reply.contains('是') && !reply.contains('否'),
            _ => false,
        }
    }

    /// Compress recent history into a short background summary for the
    /// decomposition prompt. Failure yields an empty summary, never an error.
    async fn compress_history(&self, turns: &[Turn]) -> String {
        let recent: Vec<&Turn> = turns
            .iter()
            .rev()
            .take(self.config.history_compress_turns)
            .rev()
            .collect();

        let max_chars = self.config.history_max_tokens * 2;
        let mut transcript = String::new();
        for turn in recent {
            let line = format!(
                "用户: {}\n助手: {}\n",
                turn.user_query, turn.assistant_response
            );
            if transcript.chars().count() + line.chars().count() > max_chars {
                let remaining = max_chars.saturating_sub(transcript.chars().count());
                transcript.extend(line.chars().take(remaining));
                break;
            }
            transcript.push_str(&line);
        }
        if transcript.is_empty() {
            return String::new();
        }

        let messages = vec![
            ChatMessage::system(prompts::HISTORY_SUMMARY_SYSTEM),
            ChatMessage::user(transcript),
        ];
        let opts = ChatOptions::deterministic().with_max_tokens(256);
        match tokio::time::timeout(Duration::from_secs(5), self.llm.complete(messages, &opts))
            .await
        {
            Ok(Ok(summary)) => summary.chars().take(200).collect(),
            _ => {
                tracing::debug!("history compression failed, continuing without summary");
                String::new()
            }
        }
    }

    /// Ask the LLM to split the query. Err carries the fallback reason.
    async fn decompose(
        &self,
        query: &str,
        history_summary: &str,
    ) -> std::result::Result<Vec<String>, String> {
        let messages = vec![
            ChatMessage::system(prompts::DECOMPOSE_SYSTEM),
            ChatMessage::user(prompts::decompose_user(query, history_summary)),
        ];
        let opts = ChatOptions::deterministic().with_max_tokens(512);

        let reply = match tokio::time::timeout(
            Duration::from_secs(self.config.decomp_timeout_secs),
            self.llm.complete(messages, &opts),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.metrics.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("decomposition call failed: {e}");
                return Err("decomposition_error".to_string());
            }
            Err(_) => {
                self.metrics.timeout_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    timeout_secs = self.config.decomp_timeout_secs,
                    "decomposition call timed out"
                );
                return Err("decomposition_timeout".to_string());
            }
        };

        let mut sub_questions = parse_sub_questions(&reply);
        sub_questions.truncate(self.config.max_depth);
        Ok(sub_questions)
    }

    async fn parallel_retrieve(
        &self,
        sub_questions: &[String],
        rerank_top_n: usize,
        retriever: &dyn Retriever,
    ) -> Vec<SubResult> {
        let worker_cap = self
            .config
            .max_parallel_retrievals
            .min(sub_questions.len())
            .max(1);

        let mut pending = FuturesUnordered::new();
        let mut queue = sub_questions.iter().cloned().enumerate().collect::<Vec<_>>();
        queue.reverse();

        let run = |idx: usize, sub: String| async move {
            let nodes = match retriever.retrieve(&sub).await {
                Ok(mut nodes) => {
                    nodes.truncate(rerank_top_n);
                    nodes
                }
                Err(e) => {
                    tracing::warn!(sub_question = %sub, "sub-question retrieval failed: {e}");
                    Vec::new()
                }
            };
            (idx, SubResult {
                sub_question: sub,
                nodes,
            })
        };

        for _ in 0..worker_cap {
            if let Some((idx, sub)) = queue.pop() {
                pending.push(run(idx, sub));
            }
        }

        let mut results: Vec<Option<SubResult>> =
            (0..sub_questions.len()).map(|_| None).collect();
        while let Some((idx, result)) = pending.next().await {
            results[idx] = Some(result);
            if let Some((next_idx, sub)) = queue.pop() {
                pending.push(run(next_idx, sub));
            }
        }
        results.into_iter().flatten().collect()
    }

    /// Union the sub-results, dedup by node id keeping the higher score,
    /// drop weak nodes, sort, truncate.
    fn merge_sub_results(&self, sub_results: &[SubResult], rerank_top_n: usize) -> Vec<ScoredNode> {
        let mut best: HashMap<String, ScoredNode> = HashMap::new();
        for result in sub_results {
            for node in &result.nodes {
                match best.get(node.id()) {
                    Some(existing) if existing.score >= node.score => {}
                    _ => {
                        best.insert(node.id().to_string(), node.clone());
                    }
                }
            }
        }

        let mut merged: Vec<ScoredNode> = best
            .into_values()
            .filter(|n| n.score >= self.config.min_score)
            .collect();
        sort_by_score_desc(&mut merged);
        merged.truncate(rerank_top_n);
        merged
    }

    /// Generate a short answer per sub-question from its top nodes. A failed
    /// call falls back to the leading text of the best node.
    async fn generate_sub_answers(&self, sub_results: &[SubResult]) -> Vec<SubAnswer> {
        let mut answers = Vec::new();
        for result in sub_results {
            if result.nodes.is_empty() {
                continue;
            }

            let references = result
                .nodes
                .iter()
                .take(3)
                .enumerate()
                .map(|(i, n)| format!("[参考 {}] {}", i + 1, n.node.text))
                .collect::<Vec<_>>()
                .join("\n");

            let messages = vec![ChatMessage::user(prompts::sub_answer_user(
                &result.sub_question,
                &references,
            ))];
            let opts = ChatOptions::deterministic().with_max_tokens(300);

            let answer = match tokio::time::timeout(
                Duration::from_secs(self.config.sub_answer_timeout_secs),
                self.llm.complete(messages, &opts),
            )
            .await
            {
                Ok(Ok(text)) if !text.trim().is_empty() => text.chars().take(200).collect(),
                outcome => {
                    if matches!(outcome, Err(_)) {
                        self.metrics.timeout_count.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::debug!(
                        sub_question = %result.sub_question,
                        "sub-answer generation failed, using top node excerpt"
                    );
                    result.nodes[0].node.text.chars().take(200).collect()
                }
            };

            answers.push(SubAnswer {
                sub_question: result.sub_question.clone(),
                answer,
            });
        }
        answers
    }

    /// Consolidate the mini-answers. The passage feeds the final prompt only;
    /// it is never shown to the user directly.
    async fn synthesize(&self, original_query: &str, sub_answers: &[SubAnswer]) -> Option<String> {
        let blocks = sub_answers
            .iter()
            .enumerate()
            .map(|(i, sa)| format!("{}. {}\n{}", i + 1, sa.sub_question, sa.answer))
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages = vec![
            ChatMessage::system(prompts::SYNTHESIS_SYSTEM),
            ChatMessage::user(prompts::synthesis_user(original_query, &blocks)),
        ];
        let opts = ChatOptions::deterministic().with_max_tokens(1024);

        match tokio::time::timeout(
            Duration::from_secs(self.config.synthesis_timeout_secs),
            self.llm.complete(messages, &opts),
        )
        .await
        {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(text),
            Ok(Err(e)) => {
                self.metrics.error_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("answer synthesis failed: {e}");
                None
            }
            _ => {
                self.metrics.timeout_count.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("answer synthesis timed out");
                None
            }
        }
    }
}

/// Parse a JSON-ish list of sub-questions out of an LLM reply.
fn parse_sub_questions(reply: &str) -> Vec<String> {
    let json = extract_json(reply);
    if let Ok(items) = serde_json::from_str::<Vec<String>>(json) {
        return items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // Line-based salvage: numbered or dashed list items.
    reply
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let body = line
                .strip_prefix('-')
                .or_else(|| {
                    line.split_once('.')
                        .filter(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
                        .map(|(_, rest)| rest)
                })?
                .trim();
            (!body.is_empty()).then(|| body.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatehouseError;
    use crate::llm::ChatStream;
    use crate::node::{Node, RetrievalSource};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct ScriptedModel {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            _: Vec<ChatMessage>,
            _: &ChatOptions,
        ) -> crate::error::Result<String> {
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| GatehouseError::Llm("no scripted reply".to_string()))
        }

        async fn stream_chat(
            &self,
            _: Vec<ChatMessage>,
            _: &ChatOptions,
        ) -> crate::error::Result<ChatStream> {
            Err(GatehouseError::Llm("not scripted".to_string()))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct MapRetriever {
        by_query: HashMap<String, Vec<(String, f64)>>,
        fallback: Vec<(String, f64)>,
    }

    #[async_trait]
    impl Retriever for MapRetriever {
        async fn retrieve(&self, query: &str) -> crate::error::Result<Vec<ScoredNode>> {
            let entries = self
                .by_query
                .get(query)
                .unwrap_or(&self.fallback)
                .clone();
            Ok(entries
                .into_iter()
                .map(|(id, score)| ScoredNode {
                    node: Node::new(id.clone(), format!("{id} 的内容")),
                    score,
                    sources: BTreeSet::from([RetrievalSource::Vector]),
                    vector_score: score,
                    bm25_score: 0.0,
                    vector_rank: Some(1),
                    bm25_rank: None,
                    matched_keywords: None,
                    initial_score: score,
                    rerank_score: None,
                    kb_name: "general".to_string(),
                })
                .collect())
        }
    }

    fn config(enabled: bool) -> SubQuestionConfig {
        SubQuestionConfig {
            enabled,
            complexity_threshold: 10,
            min_entities: 2,
            max_depth: 3,
            use_llm_judge: false,
            decomp_timeout_secs: 5,
            sub_answer_timeout_secs: 5,
            synthesis_timeout_secs: 5,
            min_score: 0.3,
            max_empty_results: 2,
            history_compress_turns: 5,
            history_max_tokens: 500,
            max_parallel_retrievals: 3,
        }
    }

    const COMPLEX_QUERY: &str = "中国护照去哪些国家免签，停留时间是多久，需要什么条件？";

    fn retriever_for_subs() -> MapRetriever {
        let mut by_query = HashMap::new();
        by_query.insert(
            "子问题一".to_string(),
            vec![("n1".to_string(), 0.9), ("n2".to_string(), 0.5)],
        );
        by_query.insert(
            "子问题二".to_string(),
            vec![("n2".to_string(), 0.8), ("n3".to_string(), 0.2)],
        );
        MapRetriever {
            by_query,
            fallback: vec![("std".to_string(), 0.7)],
        }
    }

    #[test]
    fn parse_json_array() {
        assert_eq!(
            parse_sub_questions("```json\n[\"甲\", \"乙\"]\n```"),
            vec!["甲", "乙"]
        );
    }

    #[test]
    fn parse_numbered_list_salvage() {
        let reply = "1. 哪些国家免签\n2. 停留时间多久";
        assert_eq!(
            parse_sub_questions(reply),
            vec!["哪些国家免签", "停留时间多久"]
        );
    }

    #[test]
    fn gate_requires_length_and_entities() {
        let d = SubQuestionDecomposer::new(ScriptedModel::new(&[]), config(true));
        assert!(d.should_decompose(COMPLEX_QUERY));
        assert!(!d.should_decompose("短问题"));
        assert!(!d.should_decompose("这是一个很长但是没有任何实体分隔符号的单一问题所以不该拆解吧"));
    }

    #[test]
    fn gate_disabled_flag_wins() {
        let d = SubQuestionDecomposer::new(ScriptedModel::new(&[]), config(false));
        assert!(!d.should_decompose(COMPLEX_QUERY));
    }

    #[tokio::test]
    async fn decomposes_retrieves_and_synthesizes() {
        let model = ScriptedModel::new(&[
            "[\"子问题一\", \"子问题二\"]",
            "答案一",
            "答案二",
            "综合说明文本",
        ]);
        let d = SubQuestionDecomposer::new(model, config(true));
        let retriever = retriever_for_subs();

        let (nodes, meta) = d
            .retrieve_with_decomposition(COMPLEX_QUERY, 15, None, &retriever)
            .await
            .unwrap();

        assert!(meta.decomposed);
        assert_eq!(meta.sub_questions.len(), 2);
        assert_eq!(meta.sub_answers.len(), 2);
        assert_eq!(meta.synthesized_answer.as_deref(), Some("综合说明文本"));

        // union of n1/n2/n3 minus the below-threshold n3
        let ids: Vec<&str> = nodes.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        // n2 keeps its best score across sub-results
        assert!((nodes[1].score - 0.8).abs() < 1e-9);

        let m = d.metrics();
        assert_eq!(m.total_queries, 1);
        assert_eq!(m.decomposed_queries, 1);
    }

    #[tokio::test]
    async fn decomposition_timeout_falls_back_to_standard() {
        struct Hanging;
        #[async_trait]
        impl ChatModel for Hanging {
            async fn complete(
                &self,
                _: Vec<ChatMessage>,
                _: &ChatOptions,
            ) -> crate::error::Result<String> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
            async fn stream_chat(
                &self,
                _: Vec<ChatMessage>,
                _: &ChatOptions,
            ) -> crate::error::Result<ChatStream> {
                Err(GatehouseError::Llm("unused".to_string()))
            }
            fn model_name(&self) -> &str {
                "hanging"
            }
        }

        let mut cfg = config(true);
        cfg.decomp_timeout_secs = 1;
        let d = SubQuestionDecomposer::new(Arc::new(Hanging), cfg);
        let retriever = retriever_for_subs();

        let (nodes, meta) = d
            .retrieve_with_decomposition(COMPLEX_QUERY, 15, None, &retriever)
            .await
            .unwrap();

        assert!(!meta.decomposed);
        assert_eq!(meta.fallback_reason.as_deref(), Some("decomposition_timeout"));
        assert_eq!(nodes[0].id(), "std");
        assert_eq!(d.metrics().timeout_count, 1);
        assert_eq!(d.metrics().fallback_count, 1);
    }

    #[tokio::test]
    async fn too_many_empty_sub_results_fall_back() {
        let model = ScriptedModel::new(&["[\"无结果甲\", \"无结果乙\"]"]);
        let mut cfg = config(true);
        cfg.max_empty_results = 2;
        let d = SubQuestionDecomposer::new(model, cfg);

        let mut by_query = HashMap::new();
        by_query.insert("无结果甲".to_string(), Vec::new());
        by_query.insert("无结果乙".to_string(), Vec::new());
        let retriever = MapRetriever {
            by_query,
            fallback: vec![("std".to_string(), 0.7)],
        };

        let (nodes, meta) = d
            .retrieve_with_decomposition(COMPLEX_QUERY, 15, None, &retriever)
            .await
            .unwrap();

        assert!(!meta.decomposed);
        assert_eq!(
            meta.fallback_reason.as_deref(),
            Some("too_many_empty_results")
        );
        assert_eq!(nodes[0].id(), "std");
    }

    #[tokio::test]
    async fn single_sub_question_is_standard_retrieve_labelled_decomposed() {
        let model = ScriptedModel::new(&["[\"只有一个子问题\"]"]);
        let d = SubQuestionDecomposer::new(model, config(true));
        let retriever = retriever_for_subs();

        let (nodes, meta) = d
            .retrieve_with_decomposition(COMPLEX_QUERY, 15, None, &retriever)
            .await
            .unwrap();

        assert!(meta.decomposed);
        assert_eq!(meta.sub_questions, vec!["只有一个子问题"]);
        assert!(meta.synthesized_answer.is_none());
        assert_eq!(nodes[0].id(), "std");
    }

    #[tokio::test]
    async fn failed_sub_answer_uses_node_excerpt() {
        // decompose succeeds, both sub-answer calls fail, synthesis succeeds
        let model = ScriptedModel::new(&["[\"子问题一\", \"子问题二\"]"]);
        let d = SubQuestionDecomposer::new(model, config(true));
        let retriever = retriever_for_subs();

        let (_, meta) = d
            .retrieve_with_decomposition(COMPLEX_QUERY, 15, None, &retriever)
            .await
            .unwrap();

        assert_eq!(meta.sub_answers.len(), 2);
        assert!(meta.sub_answers[0].answer.starts_with("n1"));
        // synthesis had no scripted reply either
        assert!(meta.synthesized_answer.is_none());
    }

    #[tokio::test]
    async fn disabled_decomposer_is_pass_through() {
        let model = ScriptedModel::new(&[]);
        let d = SubQuestionDecomposer::new(model, config(false));
        let retriever = retriever_for_subs();

        let (nodes, meta) = d
            .retrieve_with_decomposition(COMPLEX_QUERY, 15, None, &retriever)
            .await
            .unwrap();
        assert!(!meta.decomposed);
        assert!(meta.sub_questions.is_empty());
        assert_eq!(nodes[0].id(), "std");
    }
}
