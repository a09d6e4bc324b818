//! SSE stream contract tests
//!
//! The router is driven end-to-end with in-memory fakes behind the core
//! traits: every stream must open with SESSION, close with exactly one DONE,
//! keep THINK out of non-thinking requests, and attach retrieval sources to
//! every SOURCE event.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use gatehouse_core::config::Settings;
use gatehouse_core::embed::Embedder;
use gatehouse_core::error::Result;
use gatehouse_core::kb::{index_nodes, KbRegistry, KnowledgeBase};
use gatehouse_core::llm::{
    ChatMessage, ChatModel, ChatOptions, ChatStream, LlmRegistry, StreamDelta,
};
use gatehouse_core::node::Node;
use gatehouse_core::rerank::RerankModel;
use gatehouse_core::store::{MemoryStore, VectorStore};
use gatehouse_server::auth::AuthClient;
use gatehouse_server::{routes, AppState};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::sync::Arc;
use tower::util::ServiceExt;

struct CharEmbedder;

#[async_trait]
impl Embedder for CharEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; 16];
        for (i, c) in text.chars().enumerate() {
            v[i % 16] += (c as u32 % 31) as f32;
        }
        Ok(v)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::new();
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        16
    }

    fn model_name(&self) -> &str {
        "char-embedder"
    }
}

struct ConstantReranker;

#[async_trait]
impl RerankModel for ConstantReranker {
    async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
        Ok((0..passages.len()).map(|i| 0.9 - i as f32 * 0.05).collect())
    }

    fn model_name(&self) -> &str {
        "constant"
    }
}

/// Streams a canned answer, chunked to split think markers across deltas.
struct StreamingChat {
    chunks: Vec<StreamDelta>,
}

impl StreamingChat {
    fn plain() -> Arc<Self> {
        Arc::new(Self {
            chunks: vec![
                delta_content("根据规定，办理护照"),
                delta_content("需要提交```身份证```明材料。"),
            ],
        })
    }

    fn with_think_markers() -> Arc<Self> {
        Arc::new(Self {
            chunks: vec![
                delta_content("<thi"),
                delta_content("nk>先分析涉及的条款"),
                delta_content("</think>答复：需要办理签证。"),
            ],
        })
    }
}

fn delta_content(text: &str) -> StreamDelta {
    StreamDelta {
        content: Some(text.to_string()),
        reasoning: None,
    }
}

#[async_trait]
impl ChatModel for StreamingChat {
    async fn complete(&self, _: Vec<ChatMessage>, _: &ChatOptions) -> Result<String> {
        Ok("分类: general".to_string())
    }

    async fn stream_chat(&self, _: Vec<ChatMessage>, _: &ChatOptions) -> Result<ChatStream> {
        let chunks: Vec<Result<StreamDelta>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn model_name(&self) -> &str {
        "streaming-fake"
    }
}

async fn build_app(chat: Arc<dyn ChatModel>) -> axum::Router {
    let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(CharEmbedder);

    let nodes = vec![
        Node::new("n1", "中国公民申请护照应当提交身份证件")
            .with_metadata("file_name", "护照办理.md"),
        Node::new("n2", "出境人员应当接受边防检查").with_metadata("file_name", "出境检查.md"),
    ];
    index_nodes(store.as_ref(), embedder.as_ref(), "knowledge_base", &nodes)
        .await
        .unwrap();

    let mut kbs = KbRegistry::new();
    kbs.insert(
        KnowledgeBase::load("general", "knowledge_base", store.as_ref())
            .await
            .unwrap(),
    );

    let mut clients: HashMap<String, Arc<dyn ChatModel>> = HashMap::new();
    clients.insert("default".to_string(), chat);
    let registry = Arc::new(LlmRegistry::from_clients(clients, "default"));

    let mut settings = Settings::default();
    settings.auth_service_url = String::new();
    settings.intent.enabled = false;
    settings.subquestion.enabled = false;
    settings.features.visa_free = false;
    settings.features.airline = false;
    settings.features.rules = false;
    settings.features.hidden_kb = false;
    settings.retrieval.rerank_score_threshold = 0.0;
    settings.llm.default_llm_id = "default".to_string();

    let auth = Arc::new(AuthClient::new(String::new()).unwrap());
    let state = Arc::new(
        AppState::build(
            settings,
            store,
            embedder,
            Arc::new(ConstantReranker),
            registry,
            &kbs,
            auth,
        )
        .unwrap(),
    );
    state.conversation.ensure_collection().await.unwrap();
    routes::router(state)
}

async fn post_chat(app: axum::Router, path: &str, body: serde_json::Value) -> (StatusCode, String) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

/// Parse `data: TAG:payload` lines out of an SSE body.
fn events(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| {
            data.split_once(':')
                .map(|(tag, payload)| (tag.to_string(), payload.to_string()))
        })
        .collect()
}

#[tokio::test]
async fn general_request_satisfies_stream_invariants() {
    let app = build_app(StreamingChat::plain()).await;
    let (status, body) = post_chat(
        app,
        "/api/knowledge_chat",
        serde_json::json!({"question": "如何办理护照？", "thinking": false}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = events(&body);
    assert!(!events.is_empty());

    // SESSION first, exactly once
    assert_eq!(events[0].0, "SESSION");
    assert_eq!(events.iter().filter(|(t, _)| t == "SESSION").count(), 1);
    // DONE last, exactly once
    assert_eq!(events.last().unwrap().0, "DONE");
    assert_eq!(events.iter().filter(|(t, _)| t == "DONE").count(), 1);
    // no THINK without thinking mode, no ERROR
    assert!(events.iter().all(|(t, _)| t != "THINK"));
    assert!(events.iter().all(|(t, _)| t != "ERROR"));

    // generated content carries no fenced code markers
    let content: String = events
        .iter()
        .filter(|(t, _)| t == "CONTENT")
        .map(|(_, p)| p.as_str())
        .collect();
    assert!(!content.contains("```"));
    assert!(content.contains("办理护照"));

    // sources follow the answer and carry non-empty retrieval sources
    let sources: Vec<serde_json::Value> = events
        .iter()
        .filter(|(t, _)| t == "SOURCE")
        .map(|(_, p)| serde_json::from_str(p).unwrap())
        .collect();
    assert!(!sources.is_empty());
    for source in &sources {
        let tags = source["retrievalSources"].as_array().unwrap();
        assert!(!tags.is_empty());
        for tag in tags {
            assert!(matches!(tag.as_str().unwrap(), "vector" | "keyword"));
        }
        assert!(source["fileName"].as_str().unwrap().ends_with(".md"));
    }

    let last_content_idx = events.iter().rposition(|(t, _)| t == "CONTENT").unwrap();
    let first_source_idx = events.iter().position(|(t, _)| t == "SOURCE").unwrap();
    assert!(first_source_idx > last_content_idx);
}

#[tokio::test]
async fn thinking_mode_splits_think_from_content() {
    let app = build_app(StreamingChat::with_think_markers()).await;
    let (status, body) = post_chat(
        app,
        "/api/knowledge_chat",
        serde_json::json!({"question": "去泰国需要签证吗", "enable_thinking": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = events(&body);
    let think: String = events
        .iter()
        .filter(|(t, _)| t == "THINK")
        .map(|(_, p)| p.as_str())
        .collect();
    let content: String = events
        .iter()
        .filter(|(t, _)| t == "CONTENT")
        .map(|(_, p)| p.as_str())
        .collect();

    assert!(think.contains("先分析涉及的条款"));
    assert!(!think.contains("答复"));
    assert!(content.contains("答复：需要办理签证。"));
    assert!(!content.contains("think"));
}

#[tokio::test]
async fn foreign_session_is_refused_before_streaming() {
    let app = build_app(StreamingChat::plain()).await;
    let (status, body) = post_chat(
        app,
        "/api/knowledge_chat_conversation",
        serde_json::json!({"question": "问题", "session_id": "42_abcdef"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(!body.contains("SESSION:"));
}

#[tokio::test]
async fn legacy_session_prefix_is_allowed() {
    let app = build_app(StreamingChat::plain()).await;
    let (status, body) = post_chat(
        app,
        "/api/knowledge_chat_conversation",
        serde_json::json!({"question": "如何办理护照？", "session_id": "legacy_session"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = events(&body);
    assert_eq!(
        events[0],
        ("SESSION".to_string(), "legacy_session".to_string())
    );
}

#[tokio::test]
async fn turn_is_persisted_with_null_parent_on_fresh_session() {
    // Drive the handler once, then reuse the same state to inspect the
    // conversation store through a second request's history.
    let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(CharEmbedder);
    index_nodes(
        store.as_ref(),
        embedder.as_ref(),
        "knowledge_base",
        &[Node::new("n1", "护照办理规定").with_metadata("file_name", "护照.md")],
    )
    .await
    .unwrap();
    let mut kbs = KbRegistry::new();
    kbs.insert(
        KnowledgeBase::load("general", "knowledge_base", store.as_ref())
            .await
            .unwrap(),
    );

    let mut clients: HashMap<String, Arc<dyn ChatModel>> = HashMap::new();
    let chat: Arc<dyn ChatModel> = StreamingChat::plain();
    clients.insert("default".to_string(), chat);
    let registry = Arc::new(LlmRegistry::from_clients(clients, "default"));

    let mut settings = Settings::default();
    settings.auth_service_url = String::new();
    settings.intent.enabled = false;
    settings.subquestion.enabled = false;
    settings.retrieval.rerank_score_threshold = 0.0;
    settings.llm.default_llm_id = "default".to_string();

    let state = Arc::new(
        AppState::build(
            settings,
            store,
            embedder,
            Arc::new(ConstantReranker),
            registry,
            &kbs,
            Arc::new(AuthClient::new(String::new()).unwrap()),
        )
        .unwrap(),
    );
    state.conversation.ensure_collection().await.unwrap();
    let app = routes::router(state.clone());

    let (_, body) = post_chat(
        app,
        "/api/knowledge_chat",
        serde_json::json!({"question": "如何办理护照？"}),
    )
    .await;
    let session_id = events(&body)
        .into_iter()
        .find(|(t, _)| t == "SESSION")
        .map(|(_, p)| p)
        .unwrap();

    let turns = state.conversation.recent(&session_id, 10).await;
    assert_eq!(turns.len(), 1);
    assert!(turns[0].parent_turn_id.is_none());
    assert_eq!(turns[0].user_query, "如何办理护照？");
    assert!(!turns[0].context_docs.is_empty());
}
