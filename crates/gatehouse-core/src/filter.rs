//! InsertBlock node filtering
//!
//! Each reranked candidate is judged by an LLM: can this regulation text
//! answer the question, and which passage is the key one. Calls run on a
//! bounded worker pool; every call is wrapped in an abandonable timeout so a
//! hung model can never pin a pool slot. When more than half the calls time
//! out or error, the whole filter is reported as critical and the caller
//! falls back to the unfiltered candidates.

use crate::config::InsertBlockConfig;
use crate::error::{GatehouseError, Result};
use crate::llm::{extract_json, ChatMessage, ChatModel, ChatOptions};
use crate::node::ScoredNode;
use crate::prompts;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// One accepted candidate with the judge's verdict attached.
#[derive(Debug, Clone)]
pub struct FilteredNode {
    pub node: ScoredNode,
    pub is_relevant: bool,
    pub can_answer: bool,
    pub key_passage: String,
    pub reasoning: String,
}

#[derive(Deserialize, Default)]
struct Verdict {
    #[serde(default)]
    is_relevant: bool,
    #[serde(default)]
    can_answer: bool,
    #[serde(default)]
    key_passage: String,
    #[serde(default)]
    reasoning: String,
}

enum CallOutcome {
    Judged(Option<FilteredNode>),
    TimedOut,
    Errored,
}

/// Per-node LLM relevance filter.
pub struct InsertBlockFilter {
    config: InsertBlockConfig,
}

impl InsertBlockFilter {
    pub fn new(config: InsertBlockConfig) -> Self {
        Self { config }
    }

    /// Judge every candidate and keep the answerable ones, preserving the
    /// input order. Raises [`GatehouseError::FilterCritical`] when over half
    /// the calls fail.
    pub async fn filter(
        &self,
        llm: Arc<dyn ChatModel>,
        question: &str,
        nodes: &[ScoredNode],
    ) -> Result<Vec<FilteredNode>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let per_call_timeout = Duration::from_secs(self.config.per_call_timeout_secs);
        let total = nodes.len();

        let outcomes: Vec<(usize, CallOutcome)> = stream::iter(nodes.iter().enumerate())
            .map(|(idx, node)| {
                let llm = llm.clone();
                let node = node.clone();
                let question = question.to_string();
                async move {
                    let outcome = judge_node(llm, &question, node, per_call_timeout).await;
                    (idx, outcome)
                }
            })
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;

        let timeouts = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CallOutcome::TimedOut))
            .count();
        let errors = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, CallOutcome::Errored))
            .count();

        if timeouts * 2 > total || errors * 2 > total {
            return Err(GatehouseError::FilterCritical(format!(
                "{timeouts}/{total} timeouts, {errors}/{total} errors"
            )));
        }

        let mut accepted: Vec<(usize, FilteredNode)> = outcomes
            .into_iter()
            .filter_map(|(idx, outcome)| match outcome {
                CallOutcome::Judged(Some(filtered)) => Some((idx, filtered)),
                _ => None,
            })
            .collect();
        accepted.sort_by_key(|(idx, _)| *idx);

        tracing::info!(
            total,
            kept = accepted.len(),
            timeouts,
            errors,
            "insert-block filtering complete"
        );
        Ok(accepted.into_iter().map(|(_, f)| f).collect())
    }
}

async fn judge_node(
    llm: Arc<dyn ChatModel>,
    question: &str,
    node: ScoredNode,
    per_call_timeout: Duration,
) -> CallOutcome {
    let prompt = prompts::insert_block_prompt(question, node.node.text.trim());
    let messages = vec![ChatMessage::user(prompt)];
    let opts = ChatOptions::deterministic().with_max_tokens(512);

    let reply = match tokio::time::timeout(per_call_timeout, llm.complete(messages, &opts)).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            tracing::warn!(file = node.node.file_name(), "insert-block call failed: {e}");
            return CallOutcome::Errored;
        }
        Err(_) => {
            tracing::warn!(
                file = node.node.file_name(),
                "insert-block call abandoned after timeout"
            );
            return CallOutcome::TimedOut;
        }
    };

    // Unparseable verdicts mean "cannot answer", not an error.
    let verdict: Verdict = match serde_json::from_str(extract_json(&reply)) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(file = node.node.file_name(), "verdict parse failed: {e}");
            return CallOutcome::Judged(None);
        }
    };

    if !verdict.can_answer {
        return CallOutcome::Judged(None);
    }

    CallOutcome::Judged(Some(FilteredNode {
        node,
        is_relevant: verdict.is_relevant,
        can_answer: verdict.can_answer,
        key_passage: verdict.key_passage,
        reasoning: verdict.reasoning,
    }))
}
