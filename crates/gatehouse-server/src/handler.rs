//! Request pipeline
//!
//! One coordinator task per request: route the query, retrieve (optionally
//! through the decomposer), rerank, filter, assemble context and messages,
//! stream the model answer through the think/content demultiplexer, emit
//! sources, persist the turn. Stage failures degrade; only LLM stream errors
//! and ownership violations surface to the client.

use crate::auth::{check_session_ownership, mint_session_id};
use crate::sse::{clean_content, Frame, Span, ThinkDemux};
use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use gatehouse_core::conversation::Turn;
use gatehouse_core::filter::FilteredNode;
use gatehouse_core::llm::{ChatMessage, ChatOptions};
use gatehouse_core::node::{RetrievalMetadata, ScoredNode};
use gatehouse_core::prompts;
use gatehouse_core::rerank::rerank_candidates;
use gatehouse_core::retrieve::{Retriever, StrategyRetriever};
use gatehouse_core::GatehouseError;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Chat request body, shared by both endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub thinking: Option<bool>,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub rerank_top_n: Option<usize>,
    #[serde(default)]
    pub use_insert_block: Option<bool>,
    #[serde(default)]
    pub insert_block_llm_id: Option<String>,
}

impl ChatRequest {
    fn thinking_enabled(&self) -> bool {
        self.enable_thinking.or(self.thinking).unwrap_or(false)
    }
}

/// `POST /api/knowledge_chat`: single-turn QA stream.
pub async fn knowledge_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    chat_endpoint(state, headers, request, false).await
}

/// `POST /api/knowledge_chat_conversation`: multi-turn QA stream.
pub async fn knowledge_chat_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    chat_endpoint(state, headers, request, true).await
}

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

async fn chat_endpoint(
    state: Arc<AppState>,
    headers: HeaderMap,
    request: ChatRequest,
    with_history: bool,
) -> Response {
    let token = bearer_token(&headers);
    let auth = match state.auth.validate(&token).await {
        Ok(auth) => auth,
        Err(e) => {
            tracing::warn!("authentication rejected: {e}");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    // Ownership is enforced before the stream opens.
    if let Some(session_id) = &request.session_id {
        if let Err(e) = check_session_ownership(session_id, auth.userid) {
            tracing::warn!(%session_id, "session ownership violation: {e}");
            return (StatusCode::FORBIDDEN, "session access denied").into_response();
        }
    }
    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| mint_session_id(auth.userid));

    let (tx, rx) = mpsc::channel::<Frame>(64);
    let request_id = Uuid::new_v4();
    tokio::spawn(async move {
        run_pipeline(state, request, session_id, with_history, request_id, tx).await
    });

    let stream = ReceiverStream::new(rx).map(|frame| Ok::<Event, Infallible>(frame.to_event()));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Send a frame; a closed channel means the client went away and the
/// pipeline should wind down.
async fn emit(tx: &mpsc::Sender<Frame>, frame: Frame) -> bool {
    tx.send(frame).await.is_ok()
}

async fn run_pipeline(
    state: Arc<AppState>,
    request: ChatRequest,
    session_id: String,
    with_history: bool,
    request_id: Uuid,
    tx: mpsc::Sender<Frame>,
) {
    if !emit(&tx, Frame::Session(session_id.clone())).await {
        return;
    }

    match execute(&state, &request, &session_id, with_history, request_id, &tx).await {
        Ok(()) => {}
        Err(message) => {
            tracing::error!(%request_id, "pipeline error: {message}");
            let _ = emit(&tx, Frame::Error(message)).await;
        }
    }
    let _ = emit(&tx, Frame::Done).await;
}

/// The pipeline body. `Err` carries a user-surfaced message; degradable
/// stage failures are handled inline and never reach the caller.
async fn execute<'a>(
    state: &'a AppState,
    request: &'a ChatRequest,
    session_id: &'a str,
    with_history: bool,
    request_id: Uuid,
    tx: &'a mpsc::Sender<Frame>,
) -> Result<(), String> {
    let thinking = request.thinking_enabled();
    let rerank_top_n = request
        .rerank_top_n
        .unwrap_or(state.settings.retrieval.rerank_top_n);

    if !emit(tx, Frame::Content("正在进行混合检索...".to_string())).await {
        return Ok(());
    }

    // 1. Route, then retrieve through the router-chosen retriever.
    let strategy = state.intent_router.classify(&request.question).await;
    tracing::info!(%request_id, %strategy, "intent routed");
    let retriever = StrategyRetriever::new(state.multi_kb.clone(), strategy, rerank_top_n);

    let history: Vec<Turn> = if with_history {
        state
            .conversation
            .recent(session_id, state.settings.conversation.max_recent_turns)
            .await
    } else {
        Vec::new()
    };

    let (candidates, mut metadata) = match state
        .decomposer
        .retrieve_with_decomposition(
            &request.question,
            rerank_top_n,
            Some(&history),
            &retriever,
        )
        .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(%request_id, stage = "retrieve", "retrieval failed: {e}");
            if !emit(
                tx,
                Frame::Content("检索服务暂时不可用，将基于通用知识回答。".to_string()),
            )
            .await
            {
                return Ok(());
            }
            (Vec::new(), RetrievalMetadata::default())
        }
    };
    metadata.strategy = Some(strategy);

    // 2. Rerank. A failed rerank RPC empties the candidate set by policy.
    let reranked = if candidates.is_empty() {
        Vec::new()
    } else {
        match rerank_candidates(
            state.rerank_model.as_ref(),
            &request.question,
            candidates,
            state.settings.retrieval.reranker_input_top_n,
            rerank_top_n,
            state.settings.retrieval.rerank_score_threshold,
        )
        .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(%request_id, stage = "rerank", "rerank failed: {e}");
                if !emit(
                    tx,
                    Frame::Content("重排序服务暂时不可用，将基于通用知识回答。".to_string()),
                )
                .await
                {
                    return Ok(());
                }
                Vec::new()
            }
        }
    };

    // 3. Optional per-node filtering.
    let filtered = if request.use_insert_block.unwrap_or(false) && !reranked.is_empty() {
        if !emit(tx, Frame::Content("正在使用 InsertBlock 智能过滤...".to_string())).await {
            return Ok(());
        }
        match run_insert_block(state, request, &reranked).await {
            Ok(results) if !results.is_empty() => {
                let line = format!("找到 {} 个可回答的节点", results.len());
                if !emit(tx, Frame::Content(line)).await {
                    return Ok(());
                }
                Some(results)
            }
            Ok(_) => {
                if !emit(
                    tx,
                    Frame::Content("未找到可直接回答的节点，将使用原始检索结果".to_string()),
                )
                .await
                {
                    return Ok(());
                }
                None
            }
            Err(e) => {
                tracing::warn!(%request_id, stage = "insert_block", "filter skipped: {e}");
                if !emit(
                    tx,
                    Frame::Content("InsertBlock 过滤失败，将使用原始检索结果".to_string()),
                )
                .await
                {
                    return Ok(());
                }
                None
            }
        }
    } else {
        None
    };

    // 4. Knowledge context, plus silent rules / hidden-KB supplements.
    let mut knowledge_context = build_knowledge_context(&reranked, filtered.as_deref());
    if let Some(rules) = rules_context(state, &request.question).await {
        if knowledge_context.is_empty() {
            knowledge_context = format!("{}{rules}", prompts::PREFIX_RULES);
        } else {
            knowledge_context.push_str("\n\n");
            knowledge_context.push_str(prompts::PREFIX_RULES);
            knowledge_context.push_str(&rules);
        }
    }
    if let Some(hidden) = hidden_context(state, &request.question).await {
        if !knowledge_context.is_empty() {
            knowledge_context.push_str("\n\n");
        }
        knowledge_context.push_str(&hidden);
    }

    let has_rag = !knowledge_context.is_empty();
    let status = if has_rag {
        "已找到相关资料，正在生成回答..."
    } else {
        "未找到高相关性资料，基于通用知识回答..."
    };
    if !emit(tx, Frame::Content(status.to_string())).await {
        return Ok(());
    }

    // 5. Assemble the message list.
    let system_prompt = match (has_rag, thinking) {
        (true, true) => prompts::QA_SYSTEM_RAG_THINK,
        (true, false) => prompts::QA_SYSTEM_RAG,
        (false, true) => prompts::QA_SYSTEM_NO_RAG_THINK,
        (false, false) => prompts::QA_SYSTEM_NO_RAG,
    };
    let user_msg = prompts::qa_user(&request.question);
    let knowledge = has_rag.then_some(knowledge_context.as_str());
    let synthesized = metadata.synthesized_answer.as_deref();

    let messages = if with_history {
        state
            .conversation
            .build_messages(session_id, system_prompt, knowledge, synthesized, &user_msg)
            .await
    } else {
        build_single_turn_messages(system_prompt, knowledge, synthesized, &user_msg)
    };

    // 6. Stream the model answer through the demultiplexer.
    let model = state
        .llm_registry
        .get(request.model_id.as_deref())
        .map_err(|e| format!("模型不可用: {e}"))?;
    let opts = ChatOptions::default()
        .with_temperature(if thinking { 0.5 } else { 0.0 })
        .with_max_tokens(state.settings.llm.max_tokens)
        .with_thinking(thinking);

    let mut stream = model
        .stream_chat(messages, &opts)
        .await
        .map_err(|e| format!("生成回答失败: {e}"))?;

    let mut demux = ThinkDemux::new();
    let mut answer = String::new();
    while let Some(delta) = stream.next().await {
        let delta = delta.map_err(|e| format!("生成回答中断: {e}"))?;
        if let Some(reasoning) = delta.reasoning {
            if thinking && !reasoning.is_empty() {
                if !emit(tx, Frame::Think(reasoning)).await {
                    return Ok(());
                }
            }
        }
        if let Some(content) = delta.content {
            for span in demux.feed(&content) {
                if !emit_span(tx, span, thinking, &mut answer).await {
                    return Ok(());
                }
            }
        }
    }
    for span in demux.finish() {
        if !emit_span(tx, span, thinking, &mut answer).await {
            return Ok(());
        }
    }

    // 7. Sources, then the best-effort conversation write.
    let context_docs = emit_sources(tx, &reranked, filtered.as_deref()).await;
    let Some(context_docs) = context_docs else {
        return Ok(());
    };

    if let Err(e) = state
        .conversation
        .add_turn(session_id, &request.question, &answer, context_docs, None)
        .await
    {
        tracing::warn!(%request_id, session_id, "conversation write dropped: {e}");
    }

    Ok(())
}

async fn emit_span(
    tx: &mpsc::Sender<Frame>,
    span: Span,
    thinking: bool,
    answer: &mut String,
) -> bool {
    match span {
        Span::Content(text) => {
            let text = clean_content(&text);
            if text.is_empty() {
                return true;
            }
            answer.push_str(&text);
            emit(tx, Frame::Content(text)).await
        }
        Span::Think(text) => {
            if !thinking || text.is_empty() {
                return true;
            }
            emit(tx, Frame::Think(text)).await
        }
    }
}

async fn run_insert_block(
    state: &AppState,
    request: &ChatRequest,
    reranked: &[ScoredNode],
) -> Result<Vec<FilteredNode>, GatehouseError> {
    let llm = state
        .llm_registry
        .get(request.insert_block_llm_id.as_deref())
        .or_else(|_| state.llm_registry.default_client())?;
    let deadline = Duration::from_secs(state.settings.insert_block.request_deadline_secs);

    match tokio::time::timeout(
        deadline,
        state
            .insert_filter
            .filter(llm, &request.question, reranked),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(GatehouseError::Timeout(deadline)),
    }
}

/// Format the accepted nodes as numbered regulation blocks. InsertBlock
/// results prefer their extracted key passage over the raw node text.
fn build_knowledge_context(
    reranked: &[ScoredNode],
    filtered: Option<&[FilteredNode]>,
) -> String {
    match filtered {
        Some(results) => results
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let content = if f.key_passage.is_empty() {
                    f.node.node.text.trim()
                } else {
                    f.key_passage.as_str()
                };
                format!(
                    "### 来源 {} - {}:\n> {}",
                    i + 1,
                    f.node.node.file_name(),
                    content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
        None => reranked
            .iter()
            .enumerate()
            .map(|(i, n)| {
                format!(
                    "### 来源 {} - {}:\n> {}",
                    i + 1,
                    n.node.file_name(),
                    n.node.text.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Tiered rules injection: nodes at or above the strong threshold always
/// qualify; the weak tier fills remaining slots only when strong hits are
/// scarce. Gated on the dense similarity, which is what the thresholds are
/// calibrated against.
async fn rules_context(state: &AppState, query: &str) -> Option<String> {
    let retriever = state.rules_retriever.as_ref()?;
    let nodes = match retriever.retrieve(query).await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::warn!("rules retrieval failed: {e}");
            return None;
        }
    };

    let cfg = &state.settings.rules;
    let mut picked: Vec<&ScoredNode> = nodes
        .iter()
        .filter(|n| n.vector_score >= cfg.strong_threshold)
        .take(cfg.max_rules)
        .collect();
    if picked.len() < cfg.max_rules {
        let weak = nodes
            .iter()
            .filter(|n| {
                n.vector_score >= cfg.weak_threshold && n.vector_score < cfg.strong_threshold
            })
            .take(cfg.max_rules - picked.len());
        picked.extend(weak);
    }
    if picked.is_empty() {
        return None;
    }

    Some(
        picked
            .iter()
            .enumerate()
            .map(|(i, n)| format!("{}. [{}] {}", i + 1, n.node.file_name(), n.node.text.trim()))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Hidden-KB context is appended silently; no SOURCE events are emitted
/// for it.
async fn hidden_context(state: &AppState, query: &str) -> Option<String> {
    let retriever = state.hidden_retriever.as_ref()?;
    let nodes = match retriever.retrieve(query).await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::warn!("hidden-KB retrieval failed: {e}");
            return None;
        }
    };
    if nodes.is_empty() {
        return None;
    }
    Some(
        nodes
            .iter()
            .take(3)
            .map(|n| n.node.text.trim().to_string())
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}

/// Single-turn message assembly: same fixed order as the conversation
/// manager, minus the history blocks.
fn build_single_turn_messages(
    system_prompt: &str,
    knowledge_context: Option<&str>,
    synthesized_answer: Option<&str>,
    user_msg: &str,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    if let Some(context) = knowledge_context.filter(|c| !c.is_empty()) {
        messages.push(ChatMessage::system(format!(
            "{}{context}",
            prompts::PREFIX_REGULATIONS
        )));
    }
    if let Some(synthesized) = synthesized_answer.filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::system(format!(
            "{}{synthesized}",
            prompts::PREFIX_SYNTHESIZED
        )));
    }
    messages.push(ChatMessage::user(user_msg.to_string()));
    messages
}

fn format_score(score: f64) -> String {
    format!("{score:.4}")
}

/// Emit one SOURCE frame per accepted node. Returns the cited file names,
/// or `None` when the client disconnected mid-emit.
async fn emit_sources(
    tx: &mpsc::Sender<Frame>,
    reranked: &[ScoredNode],
    filtered: Option<&[FilteredNode]>,
) -> Option<Vec<String>> {
    let mut context_docs = Vec::new();

    match filtered {
        Some(results) => {
            for (i, f) in results.iter().enumerate() {
                context_docs.push(f.node.node.file_name().to_string());
                let mut source = source_json(i, &f.node);
                source["canAnswer"] = json!(f.can_answer);
                source["keyPassage"] = json!(f.key_passage);
                source["reasoning"] = json!(f.reasoning);
                if !emit(tx, Frame::Source(source)).await {
                    return None;
                }
            }
        }
        None => {
            for (i, node) in reranked.iter().enumerate() {
                context_docs.push(node.node.file_name().to_string());
                if !emit(tx, Frame::Source(source_json(i, node))).await {
                    return None;
                }
            }
        }
    }
    Some(context_docs)
}

fn source_json(index: usize, node: &ScoredNode) -> serde_json::Value {
    let mut source = json!({
        "id": index + 1,
        "fileName": node.node.file_name(),
        "initialScore": format_score(node.initial_score),
        "rerankedScore": format_score(node.rerank_score.unwrap_or(node.score)),
        "content": node.node.text.trim(),
        "retrievalSources": node.source_tags(),
        "vectorScore": node.vector_score,
        "bm25Score": node.bm25_score,
    });
    if let Some(rank) = node.vector_rank {
        source["vectorRank"] = json!(rank);
    }
    if let Some(rank) = node.bm25_rank {
        source["bm25Rank"] = json!(rank);
    }
    if let Some(keywords) = &node.matched_keywords {
        source["matchedKeywords"] = json!(keywords);
    }
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::node::{Node, RetrievalSource};
    use std::collections::BTreeSet;

    fn scored(id: &str) -> ScoredNode {
        ScoredNode {
            node: Node::new(id, "规定正文").with_metadata("file_name", "规定.md"),
            score: 0.8,
            sources: BTreeSet::from([RetrievalSource::Vector, RetrievalSource::Keyword]),
            vector_score: 0.9,
            bm25_score: 4.5,
            vector_rank: Some(1),
            bm25_rank: Some(3),
            matched_keywords: Some(vec!["规定".to_string()]),
            initial_score: 0.123456,
            rerank_score: Some(0.8),
            kb_name: "general".to_string(),
        }
    }

    #[test]
    fn source_json_carries_retrieval_fields() {
        let source = source_json(0, &scored("n1"));
        assert_eq!(source["id"], 1);
        assert_eq!(source["fileName"], "规定.md");
        assert_eq!(source["initialScore"], "0.1235");
        assert_eq!(source["rerankedScore"], "0.8000");
        assert_eq!(source["retrievalSources"], json!(["vector", "keyword"]));
        assert_eq!(source["vectorRank"], 1);
        assert_eq!(source["bm25Rank"], 3);
        assert_eq!(source["matchedKeywords"], json!(["规定"]));
    }

    #[test]
    fn source_json_omits_absent_ranks() {
        let mut node = scored("n1");
        node.vector_rank = None;
        node.matched_keywords = None;
        let source = source_json(0, &node);
        assert!(source.get("vectorRank").is_none());
        assert!(source.get("matchedKeywords").is_none());
        assert_eq!(source["bm25Rank"], 3);
    }

    #[test]
    fn knowledge_context_numbers_blocks() {
        let nodes = vec![scored("a"), scored("b")];
        let context = build_knowledge_context(&nodes, None);
        assert!(context.contains("### 来源 1 - 规定.md"));
        assert!(context.contains("### 来源 2 - 规定.md"));
    }

    #[test]
    fn filtered_context_prefers_key_passage() {
        let filtered = vec![FilteredNode {
            node: scored("a"),
            is_relevant: true,
            can_answer: true,
            key_passage: "第三条关键段落".to_string(),
            reasoning: "直接命中".to_string(),
        }];
        let context = build_knowledge_context(&[], Some(&filtered));
        assert!(context.contains("第三条关键段落"));
        assert!(!context.contains("规定正文"));
    }

    #[test]
    fn single_turn_messages_keep_fixed_order() {
        let messages =
            build_single_turn_messages("系统", Some("规定"), Some("综合"), "问题");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "系统");
        assert!(messages[1].content.contains("规定"));
        assert!(messages[2].content.contains("综合"));
        assert_eq!(messages[3].role, "user");
    }
}
