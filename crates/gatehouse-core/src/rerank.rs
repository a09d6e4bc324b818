//! Candidate reranking
//!
//! The rerank model scores `(query, passage)` pairs; the stage resorts the
//! fused candidate set, applies the score threshold and top-N cut. Retrieval
//! metadata travels on the [`ScoredNode`] itself, so the stage can replace
//! the sort key without losing per-branch scores or `initial_score`.

use crate::error::{GatehouseError, Result};
use crate::node::ScoredNode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scores passages against a query. Higher is more relevant.
#[async_trait]
pub trait RerankModel: Send + Sync {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;

    fn model_name(&self) -> &str;
}

/// HTTP reranker against a TEI-shaped `/rerank` endpoint.
pub struct HttpRerankModel {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
}

#[derive(Deserialize)]
struct RerankEntry {
    index: usize,
    score: f32,
}

impl HttpRerankModel {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(GatehouseError::Http)?;
        Ok(Self {
            http_client,
            base_url: base_url.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl RerankModel for HttpRerankModel {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rerank", self.base_url);
        let request = RerankRequest {
            query,
            texts: passages,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(GatehouseError::Http)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GatehouseError::Rerank(format!(
                "rerank service error (HTTP {status}): {body}"
            )));
        }

        let entries: Vec<RerankEntry> = response.json().await.map_err(GatehouseError::Http)?;
        let mut scores = vec![0.0f32; passages.len()];
        for entry in entries {
            if entry.index < scores.len() {
                scores[entry.index] = entry.score;
            }
        }
        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Rerank stage: submit the top `input_top_n` candidates, keep those at or
/// above `threshold`, truncate to `top_n`.
///
/// Every candidate keeps its retrieval metadata; only `score` and
/// `rerank_score` change. `initial_score` is never touched.
pub async fn rerank_candidates(
    model: &dyn RerankModel,
    query: &str,
    mut candidates: Vec<ScoredNode>,
    input_top_n: usize,
    top_n: usize,
    threshold: f64,
) -> Result<Vec<ScoredNode>> {
    if candidates.is_empty() {
        return Ok(candidates);
    }

    candidates.truncate(input_top_n);

    let passages: Vec<String> = candidates.iter().map(|c| c.node.text.clone()).collect();
    let scores = model.score(query, &passages).await?;

    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.rerank_score = Some(score as f64);
        candidate.score = score as f64;
    }

    candidates.retain(|c| c.score >= threshold);
    crate::node::sort_by_score_desc(&mut candidates);
    candidates.truncate(top_n);

    tracing::debug!(
        kept = candidates.len(),
        threshold,
        "rerank stage complete"
    );
    Ok(candidates)
}
